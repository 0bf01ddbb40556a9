//! Input sanitization for everything that crosses the relay.
//!
//! Sanitization never fails; it degrades to an empty or truncated value.
//! Control characters are stripped from every free-text field. File names
//! additionally lose traversal sequences, path separators, and
//! filesystem-hostile characters.

/// Maximum device name length in characters.
pub const MAX_DEVICE_NAME: usize = 50;

/// Maximum file name length in characters.
pub const MAX_FILE_NAME: usize = 255;

/// Maximum chat text length in characters.
pub const MAX_CHAT_TEXT: usize = 5_000;

/// Characters a file name may not contain, beyond separators.
const HOSTILE: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

fn strip_control(s: &str) -> String {
    s.chars().filter(|c| !c.is_control()).collect()
}

/// Sanitize a device display name: strip control characters, trim, cap at
/// [`MAX_DEVICE_NAME`] characters.
pub fn device_name(raw: &str) -> String {
    strip_control(raw)
        .trim()
        .chars()
        .take(MAX_DEVICE_NAME)
        .collect()
}

/// Sanitize a file name: strip control characters, traversal sequences,
/// path separators and hostile characters, trim, cap at [`MAX_FILE_NAME`].
pub fn file_name(raw: &str) -> String {
    // Hostile characters go first: removing them later could splice two
    // stray dots back into a traversal sequence.
    strip_control(raw)
        .chars()
        .filter(|c| !HOSTILE.contains(c) && *c != '/' && *c != '\\')
        .collect::<String>()
        .replace("..", "")
        .trim()
        .chars()
        .take(MAX_FILE_NAME)
        .collect()
}

/// Sanitize a relative path: strip control characters and traversal
/// sequences but keep separators, so folder structure survives transfer.
pub fn relative_path(raw: &str) -> String {
    strip_control(raw)
        .replace("..", "")
        .trim()
        .chars()
        .take(MAX_FILE_NAME)
        .collect()
}

/// Sanitize chat text: strip control characters, cap at [`MAX_CHAT_TEXT`].
pub fn chat_text(raw: &str) -> String {
    strip_control(raw).chars().take(MAX_CHAT_TEXT).collect()
}

/// Clamp a progress percentage to `[0, 100]`, mapping NaN to 0.
pub fn clamp_progress(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_and_separators_stripped() {
        assert_eq!(file_name("../../etc/passwd"), "etcpasswd");
        assert_eq!(file_name("..\\windows\\system32"), "windowssystem32");
    }

    #[test]
    fn hostile_characters_stripped() {
        assert_eq!(file_name("re<po>rt:\"v2\"|?.pdf*"), "reportv2.pdf");
    }

    #[test]
    fn control_characters_stripped_everywhere() {
        assert_eq!(device_name("Desk\x00top\x1f"), "Desktop");
        assert_eq!(chat_text("hi\x07there"), "hithere");
        assert_eq!(file_name("a\x7fb.txt"), "ab.txt");
    }

    #[test]
    fn device_name_truncated_to_50() {
        let long: String = std::iter::repeat('x').take(300).collect();
        assert_eq!(device_name(&long).len(), MAX_DEVICE_NAME);
    }

    #[test]
    fn chat_text_truncated() {
        let long: String = std::iter::repeat('m').take(6_000).collect();
        assert_eq!(chat_text(&long).chars().count(), MAX_CHAT_TEXT);
    }

    #[test]
    fn empty_and_whitespace_degrade_to_empty() {
        assert_eq!(device_name("   "), "");
        assert_eq!(file_name(""), "");
    }

    #[test]
    fn relative_path_keeps_separators() {
        assert_eq!(relative_path("photos/2024/a.jpg"), "photos/2024/a.jpg");
        assert_eq!(relative_path("../../etc/passwd"), "//etc/passwd");
    }

    #[test]
    fn progress_clamped() {
        assert_eq!(clamp_progress(-5.0), 0.0);
        assert_eq!(clamp_progress(150.0), 100.0);
        assert_eq!(clamp_progress(f64::NAN), 0.0);
        assert_eq!(clamp_progress(42.5), 42.5);
    }
}
