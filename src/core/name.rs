//! Purpose: Validate user-supplied pool names before they touch the filesystem.
//! Exports: `validate_pool_name`, `MAX_POOL_NAME_LEN`.
//! Role: First line of defense for every create/participate/dispose entry point.
//! Invariants: Accepted names are safe to embed in a path on every supported OS.
//! Invariants: Rejection never depends on filesystem state, only on the string.

use crate::core::error::{Error, ErrorKind};

pub const MAX_POOL_NAME_LEN: usize = 100;

const LEGAL_CHARS: &str = " !#$%&'()+,-./0-9;=@A-Z[]^_`a-z{}~";

pub fn validate_pool_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(bad_name(name, "name is empty"));
    }
    if name.len() > MAX_POOL_NAME_LEN {
        return Err(bad_name(name, "name exceeds 100 bytes"));
    }
    for ch in name.chars() {
        if !legal_char(ch) {
            return Err(bad_name(name, format!("illegal character {ch:?}")));
        }
    }
    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return Err(bad_name(name, "empty path component"));
    }
    for component in name.split('/') {
        validate_component(name, component)?;
    }
    Ok(())
}

fn legal_char(ch: char) -> bool {
    match ch {
        '0'..='9' | 'A'..='Z' | 'a'..='z' => true,
        _ => LEGAL_CHARS.contains(ch),
    }
}

fn validate_component(name: &str, component: &str) -> Result<(), Error> {
    // A leading '.' rules out "." and ".." and hidden files in one check.
    if component.starts_with('.') {
        return Err(bad_name(name, "component starts with '.'"));
    }
    if component.ends_with(' ') || component.ends_with('.') || component.ends_with('$') {
        return Err(bad_name(name, "component ends with ' ', '.' or '$'"));
    }
    if is_reserved_component(component) {
        return Err(bad_name(name, format!("reserved name component {component:?}")));
    }
    Ok(())
}

// Windows device names are forbidden as a whole component or as a stem
// before an extension; "lost+found" has special meaning on unix.
fn is_reserved_component(component: &str) -> bool {
    let lower = component.to_ascii_lowercase();
    if lower == "lost+found" {
        return true;
    }
    let stem = match lower.split_once('.') {
        Some((stem, _)) => stem,
        None => lower.as_str(),
    };
    match stem {
        "con" | "prn" | "aux" | "nul" => true,
        _ => {
            stem.len() == 4
                && (stem.starts_with("com") || stem.starts_with("lpt"))
                && stem.as_bytes()[3].is_ascii_digit()
                && stem.as_bytes()[3] != b'0'
        }
    }
}

fn bad_name(name: &str, reason: impl Into<String>) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(format!("invalid pool name {name:?}: {}", reason.into()))
}

#[cfg(test)]
mod tests {
    use super::validate_pool_name;

    #[test]
    fn accepts_ordinary_names() {
        for name in [
            "telemetry",
            "sensor-3",
            "team/scratch pad",
            "a",
            "deep/ly/nested/pool",
            "mixed_CASE.v2",
        ] {
            assert!(validate_pool_name(name).is_ok(), "rejected {name:?}");
        }
    }

    #[test]
    fn rejects_traversal_and_hidden_components() {
        for name in ["..", "../escape", "a/../b", ".hidden", "a/.b", "/rooted", "a//b", "trail/"] {
            assert!(validate_pool_name(name).is_err(), "accepted {name:?}");
        }
    }

    #[test]
    fn rejects_reserved_device_names() {
        for name in ["con", "CON", "prn.txt", "com1", "LPT9", "a/nul/b", "lost+found"] {
            assert!(validate_pool_name(name).is_err(), "accepted {name:?}");
        }
        for name in ["com0", "console", "lpt", "comx", "null"] {
            assert!(validate_pool_name(name).is_ok(), "rejected {name:?}");
        }
    }

    #[test]
    fn rejects_illegal_characters_and_length() {
        assert!(validate_pool_name("no\ttabs").is_err());
        assert!(validate_pool_name("no:colons").is_err());
        assert!(validate_pool_name("no*stars").is_err());
        assert!(validate_pool_name("").is_err());
        let long = "x".repeat(101);
        assert!(validate_pool_name(&long).is_err());
        let exact = "x".repeat(100);
        assert!(validate_pool_name(&exact).is_ok());
    }

    #[test]
    fn rejects_trailing_dot_space_dollar() {
        for name in ["bad.", "bad ", "bad$", "ok/also bad "] {
            assert!(validate_pool_name(name).is_err(), "accepted {name:?}");
        }
    }
}
