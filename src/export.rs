//! Rendering of finished transcripts.

use std::fmt::Write;

use crate::job::Transcript;

/// `HH:MM:SS,mmm`, the SubRip timestamp format.
pub fn srt_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let (hours, rest) = (total_ms / 3_600_000, total_ms % 3_600_000);
    let (minutes, rest) = (rest / 60_000, rest % 60_000);
    let (secs, millis) = (rest / 1000, rest % 1000);
    format!("{hours:02}:{minutes:02}:{secs:02},{millis:03}")
}

/// SubRip subtitles with one cue per segment, numbered from 1.
pub fn to_srt(transcript: &Transcript) -> String {
    let mut out = String::new();
    for (index, segment) in transcript.segments.iter().enumerate() {
        let _ = writeln!(out, "{}", index + 1);
        let _ = writeln!(
            out,
            "{} --> {}",
            srt_timestamp(segment.start),
            srt_timestamp(segment.end)
        );
        let _ = writeln!(out, "{}", segment.text.trim());
        out.push('\n');
    }
    out
}

/// Plain text, one segment per line. Falls back to the full text when the
/// engine returned no segments.
pub fn to_text(transcript: &Transcript) -> String {
    if transcript.segments.is_empty() {
        return format!("{}\n", transcript.text.trim());
    }
    let mut out = String::new();
    for segment in &transcript.segments {
        out.push_str(segment.text.trim());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Segment;

    fn transcript(segments: Vec<(f64, f64, &str)>) -> Transcript {
        Transcript {
            text: segments.iter().map(|s| s.2).collect::<Vec<_>>().join(" "),
            segments: segments
                .into_iter()
                .map(|(start, end, text)| Segment {
                    start,
                    end,
                    text: text.to_string(),
                    avg_logprob: None,
                })
                .collect(),
            language: "en".into(),
            language_probability: 0.99,
            duration_seconds: 0.0,
            processing_seconds: 0.0,
        }
    }

    #[test]
    fn timestamps_use_comma_millis() {
        assert_eq!(srt_timestamp(0.0), "00:00:00,000");
        assert_eq!(srt_timestamp(1.5), "00:00:01,500");
        assert_eq!(srt_timestamp(3723.004), "01:02:03,004");
        assert_eq!(srt_timestamp(-2.0), "00:00:00,000");
    }

    #[test]
    fn srt_numbers_cues_from_one() {
        let t = transcript(vec![(0.0, 2.25, " Hello there."), (2.25, 4.0, "General Kenobi.")]);
        assert_eq!(
            to_srt(&t),
            "1\n00:00:00,000 --> 00:00:02,250\nHello there.\n\n\
             2\n00:00:02,250 --> 00:00:04,000\nGeneral Kenobi.\n\n"
        );
    }

    #[test]
    fn text_has_one_line_per_segment() {
        let t = transcript(vec![(0.0, 1.0, " one"), (1.0, 2.0, "two ")]);
        assert_eq!(to_text(&t), "one\ntwo\n");
    }

    #[test]
    fn text_without_segments_uses_full_text() {
        let mut t = transcript(vec![]);
        t.text = "just text".into();
        assert_eq!(to_text(&t), "just text\n");
        assert_eq!(to_srt(&t), "");
    }
}
