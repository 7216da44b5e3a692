//! `/etc/os-release` loading for the `init` message.

use std::path::Path;

use serde_json::{Map, Value};
use tracing::debug;

/// The fields relayed to the peer; everything else stays local.
const RELEVANT_FIELDS: &[&str] = &[
    "NAME",
    "ID",
    "PRETTY_NAME",
    "VARIANT",
    "VARIANT_ID",
    "VERSION",
    "VERSION_ID",
    "PLATFORM_ID",
    "ID_LIKE",
    "DOCUMENTATION_URL",
];

/// Parse the os-release format: `KEY=value` lines, values possibly
/// quoted, `#` comments and blank lines skipped.
pub fn parse(contents: &str) -> Map<String, Value> {
    let mut fields = Map::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some(pair) => pair,
            None => continue,
        };

        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|v| v.strip_suffix('\''))
            })
            .unwrap_or(value);

        if RELEVANT_FIELDS.contains(&key) {
            fields.insert(key.to_string(), Value::String(value.to_string()));
        }
    }

    fields
}

/// Load and filter the host's os-release file.
pub fn load() -> Option<Map<String, Value>> {
    let path = ["/etc/os-release", "/usr/lib/os-release"]
        .iter()
        .map(Path::new)
        .find(|path| path.exists())?;

    match std::fs::read_to_string(path) {
        Ok(contents) => Some(parse(&contents)),
        Err(err) => {
            debug!("couldn't read {}: {}", path.display(), err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fields() {
        let fields = parse(
            "NAME=\"Fedora Linux\"\n\
             VERSION_ID=41\n\
             # comment\n\
             \n\
             HOME_URL='https://fedoraproject.org/'\n\
             SECRET_LOCAL_THING=hidden\n\
             PRETTY_NAME=\"Fedora Linux 41\"\n",
        );

        assert_eq!(fields["NAME"], "Fedora Linux");
        assert_eq!(fields["VERSION_ID"], "41");
        assert_eq!(fields["PRETTY_NAME"], "Fedora Linux 41");
        assert!(fields.get("HOME_URL").is_none());
        assert!(fields.get("SECRET_LOCAL_THING").is_none());
    }

    #[test]
    fn tolerates_garbage() {
        let fields = parse("no equals sign\nNAME=ok");
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["NAME"], "ok");
    }
}
