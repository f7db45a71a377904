//! Codec preference for session descriptions
//!
//! Codec order in an `m=` line is the order of preference the remote side
//! uses when it answers. The mesh puts Opus first for audio and orders video
//! VP9, H.264, VP8 on devices that handle VP9 well, H.264, VP8 otherwise.
//! Codecs not named keep their relative order after the preferred ones; no
//! codec is ever removed.

use std::collections::HashMap;

/// Preferred codec order per media kind, by rtpmap encoding name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecPreferences {
    audio: Vec<&'static str>,
    video: Vec<&'static str>,
}

impl CodecPreferences {
    pub fn for_device(prefer_vp9: bool) -> Self {
        let video = if prefer_vp9 {
            vec!["VP9", "H264", "VP8"]
        } else {
            vec!["H264", "VP8"]
        };
        Self {
            audio: vec!["opus"],
            video,
        }
    }

    /// Reorder payload types of every audio and video `m=` line
    ///
    /// Line endings of the input are preserved. Sections other than audio
    /// and video (e.g. `application`) are left untouched.
    pub fn apply(&self, sdp: &str) -> String {
        let line_ending = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
        let lines: Vec<&str> = sdp.split(line_ending).collect();
        let mut out: Vec<String> = lines.iter().map(|l| l.to_string()).collect();

        let section_starts: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.starts_with("m="))
            .map(|(i, _)| i)
            .collect();

        for (n, &start) in section_starts.iter().enumerate() {
            let end = section_starts.get(n + 1).copied().unwrap_or(lines.len());
            let media = lines[start][2..].split_whitespace().next().unwrap_or("");
            let preferences = match media {
                "audio" => &self.audio,
                "video" => &self.video,
                _ => continue,
            };
            let names = rtpmap_names(&lines[start + 1..end]);
            out[start] = reorder_media_line(lines[start], &names, preferences);
        }

        out.join(line_ending)
    }
}

/// Payload type to encoding name, from `a=rtpmap:<pt> <name>/<clock>` lines
fn rtpmap_names<'a>(section: &[&'a str]) -> HashMap<&'a str, &'a str> {
    section
        .iter()
        .filter_map(|line| line.strip_prefix("a=rtpmap:"))
        .filter_map(|rest| {
            let (pt, encoding) = rest.split_once(' ')?;
            let name = encoding.split('/').next()?;
            Some((pt, name))
        })
        .collect()
}

fn reorder_media_line(line: &str, names: &HashMap<&str, &str>, preferences: &[&str]) -> String {
    let tokens: Vec<&str> = line.split(' ').collect();
    if tokens.len() < 4 {
        return line.to_string();
    }

    let rank = |pt: &str| {
        names
            .get(pt)
            .and_then(|name| preferences.iter().position(|p| p.eq_ignore_ascii_case(name)))
            .unwrap_or(preferences.len())
    };

    let mut payload_types = tokens[3..].to_vec();
    payload_types.sort_by_key(|pt| rank(pt));

    let mut reordered = tokens[..3].to_vec();
    reordered.extend(payload_types);
    reordered.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 0 8 111\r\n\
a=mid:0\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97 98 102\r\n\
a=mid:1\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n\
a=rtpmap:98 VP9/90000\r\n\
a=rtpmap:102 H264/90000\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
a=mid:2\r\n";

    fn media_line<'a>(sdp: &'a str, media: &str) -> &'a str {
        sdp.split("\r\n")
            .find(|l| l.starts_with(&format!("m={} ", media)))
            .unwrap()
    }

    #[test]
    fn test_opus_first() {
        let sdp = CodecPreferences::for_device(false).apply(OFFER);
        assert_eq!(media_line(&sdp, "audio"), "m=audio 9 UDP/TLS/RTP/SAVPF 111 0 8");
    }

    #[test]
    fn test_video_order_without_vp9() {
        let sdp = CodecPreferences::for_device(false).apply(OFFER);
        assert_eq!(
            media_line(&sdp, "video"),
            "m=video 9 UDP/TLS/RTP/SAVPF 102 96 97 98"
        );
    }

    #[test]
    fn test_video_order_with_vp9() {
        let sdp = CodecPreferences::for_device(true).apply(OFFER);
        assert_eq!(
            media_line(&sdp, "video"),
            "m=video 9 UDP/TLS/RTP/SAVPF 98 102 96 97"
        );
    }

    #[test]
    fn test_other_lines_untouched() {
        let sdp = CodecPreferences::for_device(true).apply(OFFER);
        let without_media = |s: &'static str| -> Vec<String> {
            s.split("\r\n")
                .filter(|l| !l.starts_with("m="))
                .map(str::to_string)
                .collect()
        };
        let munged: Vec<String> = sdp
            .split("\r\n")
            .filter(|l| !l.starts_with("m="))
            .map(str::to_string)
            .collect();
        assert_eq!(without_media(OFFER), munged);
        assert!(sdp.contains("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n"));
        assert!(sdp.ends_with("a=mid:2\r\n"));
    }

    #[test]
    fn test_unix_line_endings_preserved() {
        let offer = "v=0\nm=audio 9 RTP/AVP 0 111\na=rtpmap:0 PCMU/8000\na=rtpmap:111 opus/48000/2\n";
        let sdp = CodecPreferences::for_device(false).apply(offer);
        assert_eq!(
            sdp,
            "v=0\nm=audio 9 RTP/AVP 111 0\na=rtpmap:0 PCMU/8000\na=rtpmap:111 opus/48000/2\n"
        );
    }

    #[test]
    fn test_static_payload_without_rtpmap_keeps_position() {
        let offer = "m=audio 9 RTP/AVP 0 9 111\r\na=rtpmap:111 OPUS/48000/2\r\n";
        let sdp = CodecPreferences::for_device(false).apply(offer);
        assert!(sdp.starts_with("m=audio 9 RTP/AVP 111 0 9\r\n"));
    }
}
