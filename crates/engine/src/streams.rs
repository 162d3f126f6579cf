//! Stream classification and track naming
//!
//! Partitions probed streams by type, resolves default audio/subtitle
//! tracks against the configured native language, and synthesizes
//! human-readable track titles for streams that lack one.

use crate::probe::StreamInfo;

/// One classified stream, tagged with the ffmpeg input it comes from.
///
/// Input 0 is the source file; upconverted subtitle files are appended
/// as additional inputs.
#[derive(Debug, Clone)]
pub struct ClassifiedStream {
    pub input: u32,
    pub info: StreamInfo,
}

impl ClassifiedStream {
    pub fn source(info: StreamInfo) -> Self {
        Self { input: 0, info }
    }

    /// `input:index` specifier for -map arguments.
    pub fn map_spec(&self) -> String {
        format!("{}:{}", self.input, self.info.index)
    }
}

/// Streams partitioned by type
#[derive(Debug, Clone, Default)]
pub struct ClassifiedStreams {
    pub video: Vec<ClassifiedStream>,
    pub audio: Vec<ClassifiedStream>,
    pub subtitle: Vec<ClassifiedStream>,
    pub other: Vec<ClassifiedStream>,
}

/// Partition probed streams by codec type.
///
/// Streams without a codec type are dropped with a warning; attachment
/// and data streams land in `other` and are mapped through untouched.
pub fn classify(streams: &[StreamInfo]) -> ClassifiedStreams {
    let mut classified = ClassifiedStreams::default();
    for info in streams {
        let stream = ClassifiedStream::source(info.clone());
        match info.codec_type.as_deref() {
            Some("video") => classified.video.push(stream),
            Some("audio") => classified.audio.push(stream),
            Some("subtitle") => classified.subtitle.push(stream),
            Some(_) => classified.other.push(stream),
            None => {
                tracing::warn!(index = info.index, "dropping stream with no codec type");
            }
        }
    }
    classified
}

/// Normalize a language tag to a display name.
///
/// Accepts ISO 639-1 and 639-2 codes (both bibliographic and
/// terminological spellings); anything longer is treated as an already
/// spelled-out name. Missing or unrecognized tags become "Unknown".
pub fn normalize_language(tag: Option<&str>) -> String {
    let Some(tag) = tag else {
        return "Unknown".to_string();
    };
    let lower = tag.to_ascii_lowercase();
    let known = match lower.len() {
        2 => alpha2_name(&lower),
        3 => alpha3_name(&lower),
        _ => None,
    };
    match known {
        Some(name) => name.to_string(),
        None if lower.len() > 3 => capitalize(&lower),
        None => "Unknown".to_string(),
    }
}

/// Whether two language tags name the same language.
pub fn same_language(a: &str, b: &str) -> bool {
    let a = normalize_language(Some(a));
    let b = normalize_language(Some(b));
    a != "Unknown" && a == b
}

fn alpha2_name(code: &str) -> Option<&'static str> {
    Some(match code {
        "ar" => "Arabic",
        "cs" => "Czech",
        "da" => "Danish",
        "de" => "German",
        "el" => "Greek",
        "en" => "English",
        "es" => "Spanish",
        "fi" => "Finnish",
        "fr" => "French",
        "he" => "Hebrew",
        "hi" => "Hindi",
        "hu" => "Hungarian",
        "it" => "Italian",
        "ja" => "Japanese",
        "ko" => "Korean",
        "nl" => "Dutch",
        "no" => "Norwegian",
        "pl" => "Polish",
        "pt" => "Portuguese",
        "ru" => "Russian",
        "sv" => "Swedish",
        "th" => "Thai",
        "tr" => "Turkish",
        "uk" => "Ukrainian",
        "zh" => "Chinese",
        _ => return None,
    })
}

fn alpha3_name(code: &str) -> Option<&'static str> {
    Some(match code {
        "ara" => "Arabic",
        "ces" | "cze" => "Czech",
        "dan" => "Danish",
        "deu" | "ger" => "German",
        "ell" | "gre" => "Greek",
        "eng" => "English",
        "fin" => "Finnish",
        "fra" | "fre" => "French",
        "heb" => "Hebrew",
        "hin" => "Hindi",
        "hun" => "Hungarian",
        "ita" => "Italian",
        "jpn" => "Japanese",
        "kor" => "Korean",
        "nld" | "dut" => "Dutch",
        "nor" => "Norwegian",
        "pol" => "Polish",
        "por" => "Portuguese",
        "rus" => "Russian",
        "spa" => "Spanish",
        "swe" => "Swedish",
        "tha" => "Thai",
        "tur" => "Turkish",
        "ukr" => "Ukrainian",
        "zho" | "chi" => "Chinese",
        _ => return None,
    })
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Spoken channel-layout label for an audio channel count.
pub fn format_channels(channels: u32) -> String {
    match channels {
        1 => "1.0 Channel".to_string(),
        2 => "2.0 Channel".to_string(),
        3 => "2.1 Channel".to_string(),
        6 => "5.1 Channel".to_string(),
        7 => "6.1 Channel".to_string(),
        8 => "7.1 Channel".to_string(),
        n => format!("{n} Channel"),
    }
}

/// Synthesize a display title for an audio track.
pub fn audio_title(stream: &StreamInfo) -> String {
    let language = normalize_language(stream.language_tag());
    let codec = stream
        .codec_name
        .as_deref()
        .unwrap_or("unknown")
        .to_ascii_uppercase();
    let channels = format_channels(stream.channels.unwrap_or(2));
    match stream.profile.as_deref() {
        Some(profile) => format!("{language} {codec} {profile} ({channels})"),
        None => format!("{language} {codec} ({channels})"),
    }
}

/// Title for an audio track after re-encoding, where the codec and
/// channel count no longer match what the source stream reported.
pub fn reencoded_audio_title(stream: &StreamInfo, codec: &str, channels: u32) -> String {
    let language = normalize_language(stream.language_tag());
    format!("{language} {codec} ({})", format_channels(channels))
}

/// Synthesize a display title for a subtitle track.
pub fn subtitle_title(stream: &StreamInfo) -> String {
    normalize_language(stream.language_tag())
}

/// First audio stream matching the native language, by classified order.
pub fn default_audio(audio: &[ClassifiedStream], native: &str) -> Option<usize> {
    audio.iter().position(|s| {
        s.info
            .language_tag()
            .is_some_and(|tag| same_language(tag, native))
    })
}

/// First subtitle stream matching the native language, by classified
/// order. Only consulted when no audio default was resolved.
pub fn default_subtitle(subtitle: &[ClassifiedStream], native: &str) -> Option<usize> {
    subtitle.iter().position(|s| {
        s.info
            .language_tag()
            .is_some_and(|tag| same_language(tag, native))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn stream(index: u32, codec_type: &str, codec: &str, lang: Option<&str>) -> StreamInfo {
        let mut tags = HashMap::new();
        if let Some(lang) = lang {
            tags.insert("language".to_string(), lang.to_string());
        }
        StreamInfo {
            index,
            codec_type: Some(codec_type.to_string()),
            codec_name: Some(codec.to_string()),
            tags,
            ..StreamInfo::default()
        }
    }

    #[test]
    fn test_classification_partitions_by_type() {
        let streams = vec![
            stream(0, "video", "h264", None),
            stream(1, "audio", "ac3", Some("eng")),
            stream(2, "subtitle", "subrip", Some("eng")),
            stream(3, "attachment", "ttf", None),
        ];
        let classified = classify(&streams);
        assert_eq!(classified.video.len(), 1);
        assert_eq!(classified.audio.len(), 1);
        assert_eq!(classified.subtitle.len(), 1);
        assert_eq!(classified.other.len(), 1);
        assert_eq!(classified.audio[0].map_spec(), "0:1");
    }

    #[test]
    fn test_untyped_stream_is_dropped() {
        let untyped = StreamInfo {
            index: 5,
            ..StreamInfo::default()
        };
        let classified = classify(&[untyped]);
        assert!(classified.video.is_empty());
        assert!(classified.other.is_empty());
    }

    #[test]
    fn test_language_normalization() {
        assert_eq!(normalize_language(Some("en")), "English");
        assert_eq!(normalize_language(Some("eng")), "English");
        assert_eq!(normalize_language(Some("deu")), "German");
        assert_eq!(normalize_language(Some("ger")), "German");
        assert_eq!(normalize_language(Some("japanese")), "Japanese");
        assert_eq!(normalize_language(Some("qqq")), "Unknown");
        assert_eq!(normalize_language(None), "Unknown");
    }

    #[test]
    fn test_same_language_across_tag_forms() {
        assert!(same_language("en", "eng"));
        assert!(same_language("fre", "fra"));
        assert!(!same_language("eng", "jpn"));
        // two unknowns never match
        assert!(!same_language("qqq", "zzz"));
    }

    #[test]
    fn test_audio_title_synthesis() {
        let mut info = stream(1, "audio", "ac3", Some("eng"));
        info.channels = Some(6);
        assert_eq!(audio_title(&info), "English AC3 (5.1 Channel)");

        info.profile = Some("DTS-HD MA".to_string());
        info.codec_name = Some("dts".to_string());
        assert_eq!(audio_title(&info), "English DTS DTS-HD MA (5.1 Channel)");
    }

    #[test]
    fn test_reencoded_title_reflects_new_codec_and_channels() {
        let mut info = stream(1, "audio", "dts", Some("eng"));
        info.channels = Some(6);
        info.profile = Some("DTS-HD MA".to_string());
        // the source profile does not survive a re-encode
        assert_eq!(reencoded_audio_title(&info, "OPUS", 6), "English OPUS (5.1 Channel)");
        // downmixed track
        assert_eq!(reencoded_audio_title(&info, "OPUS", 2), "English OPUS (2.0 Channel)");
    }

    #[test]
    fn test_default_track_selection_prefers_first_match() {
        let audio = vec![
            ClassifiedStream::source(stream(1, "audio", "ac3", Some("jpn"))),
            ClassifiedStream::source(stream(2, "audio", "aac", Some("eng"))),
            ClassifiedStream::source(stream(3, "audio", "ac3", Some("eng"))),
        ];
        assert_eq!(default_audio(&audio, "en"), Some(1));
        assert_eq!(default_audio(&audio, "ja"), Some(0));
        assert_eq!(default_audio(&audio, "ko"), None);
    }
}
