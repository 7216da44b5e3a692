//! Package manifest reading, override merging and validation.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::json as opt;

/// Package names: `[A-Za-z0-9_][A-Za-z0-9_.-]*`.
pub fn validate_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphanumeric() || b == b'_' => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// Served file paths: `[A-Za-z0-9_.,@/-]`, and no `..` segments.
pub fn validate_path(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    if !path
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b',' | b'@' | b'/'))
    {
        return false;
    }
    path.split('/').all(|segment| segment != "..")
}

fn read_json_file(path: &Path) -> std::io::Result<Value> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn apply_override(manifest: &mut Value, path: &Path) {
    match read_json_file(path) {
        Ok(Value::Object(ref override_map)) => {
            if let Value::Object(ref mut manifest_map) = manifest {
                opt::patch(manifest_map, override_map);
            }
        }
        Ok(_) => warn!("couldn't read {}: not a JSON object", path.display()),
        Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("no override found in {}", path.display());
        }
        Err(err) => warn!("couldn't read {}: {}", path.display(), err),
    }
}

fn expand_variables(value: &mut Value, libexecdir: &str) {
    match value {
        Value::String(s) => {
            if s.contains("${libexecdir}") {
                *s = s.replace("${libexecdir}", libexecdir);
            }
        }
        Value::Array(items) => {
            for item in items {
                expand_variables(item, libexecdir);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                expand_variables(item, libexecdir);
            }
        }
        _ => {}
    }
}

/// Read and post-process a package manifest: parse `manifest.json`,
/// merge the override files in ascending priority, and expand
/// `${libexecdir}`.
pub fn read_manifest(
    directory: &Path,
    package: &str,
    config_dirs: &[PathBuf],
    user_config_dir: &Path,
    libexecdir: &Path,
) -> Option<Value> {
    let manifest_path = directory.join("manifest.json");
    let mut manifest = match read_json_file(&manifest_path) {
        Ok(manifest) if manifest.is_object() => manifest,
        Ok(_) => {
            warn!("{}: manifest.json is not a JSON object", package);
            return None;
        }
        Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("{}: no manifest found", package);
            return None;
        }
        Err(ref err) if err.kind() == std::io::ErrorKind::NotADirectory => {
            return None;
        }
        Err(err) => {
            warn!("{}: couldn't read manifest.json: {}", package, err);
            return None;
        }
    };

    if !validate_name(package) {
        warn!("{}: package has invalid name", package);
        return None;
    }

    // Override locations, in ascending priority: beside the package
    // itself, then each system config dir, then the user's.
    apply_override(&mut manifest, &directory.join("override.json"));

    let override_name = format!("{}.override.json", package);
    for dir in config_dirs {
        apply_override(&mut manifest, &dir.join("cockpit").join(&override_name));
    }
    apply_override(
        &mut manifest,
        &user_config_dir.join("cockpit").join(&override_name),
    );

    expand_variables(&mut manifest, &libexecdir.to_string_lossy());

    Some(manifest)
}

/// The effective package name, which the manifest may override.
pub fn package_name<'a>(manifest: &'a Value, fallback: &'a str) -> Option<&'a str> {
    match opt::get_str(manifest, "name") {
        Ok(Some(name)) if validate_name(name) => Some(name),
        Ok(Some(_)) => {
            warn!("{}: invalid package \"name\" field in manifest", fallback);
            None
        }
        Ok(None) => Some(fallback),
        Err(_) => {
            warn!("{}: invalid \"name\" field in package manifest", fallback);
            None
        }
    }
}

/// Manifest priority; higher wins a name contest. Defaults to 1.
pub fn priority(manifest: &Value) -> f64 {
    match opt::get_double(manifest, "priority") {
        Ok(priority) => priority.unwrap_or(1.0),
        Err(_) => {
            warn!("invalid \"priority\" field in package manifest");
            1.0
        }
    }
}

/// Where the package's files live: the scan directory, unless the
/// manifest `base` relocates it.
pub fn base_directory(manifest: &Value, name: &str, path: &Path) -> Option<PathBuf> {
    match opt::get_str(manifest, "base") {
        Ok(None) => Some(path.to_path_buf()),
        Ok(Some(base)) => {
            let base = Path::new(base);
            if base.is_absolute() {
                Some(base.to_path_buf())
            } else {
                Some(path.join(base))
            }
        }
        Err(_) => {
            warn!("{}: invalid 'base' field in manifest", name);
            None
        }
    }
}

/// Compare dotted version strings segment-wise and numerically.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |version: &str| -> Vec<u64> {
        version
            .split('.')
            .map(|segment| {
                segment
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };

    let a = parse(a);
    let b = parse(b);
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

/// Check `requires` and report why the package is unavailable, if it
/// is. An invalid `requires` shape rejects the package outright.
pub fn check_requires(manifest: &Value, name: &str, version: &str) -> Result<Option<String>, ()> {
    let requires = match opt::get_object(manifest, "requires") {
        Ok(requires) => requires,
        Err(_) => {
            warn!("{}: invalid \"requires\" field", name);
            return Err(());
        }
    };

    let requires = match requires {
        Some(requires) => requires,
        None => return Ok(None),
    };

    let mut unavailable = None;

    for (key, value) in requires {
        if key == "cockpit" {
            let minimum = match value {
                Value::String(minimum) => minimum,
                _ => {
                    warn!("{}: invalid \"cockpit\" requirement field", name);
                    return Err(());
                }
            };
            if compare_versions(version, minimum) == std::cmp::Ordering::Less {
                debug!(
                    "{}: package requires a later version of cockpit: {} > {}",
                    name, minimum, version
                );
                unavailable = Some(format!(
                    "This package requires Cockpit version {} or later",
                    minimum
                ));
            }
        } else {
            debug!("{}: package has an unknown requirement: {}", name, key);
            unavailable =
                Some("This package is not compatible with this version of Cockpit".to_string());
        }
    }

    Ok(unavailable)
}

/// A valid single-line header value.
pub fn is_header_value(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b == b'\t' || (0x20..0x7f).contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn name_validation() {
        assert!(validate_name("shell"));
        assert!(validate_name("net-work_1.0"));
        assert!(validate_name("_x"));
        assert!(!validate_name(""));
        assert!(!validate_name(".hidden"));
        assert!(!validate_name("-lead"));
        assert!(!validate_name("has space"));
        assert!(!validate_name("sla/sh"));
    }

    #[test]
    fn path_validation() {
        assert!(validate_path("dir/file.js"));
        assert!(validate_path("po.de.js.gz"));
        assert!(validate_path("some@file,x"));
        assert!(!validate_path(""));
        assert!(!validate_path("../up"));
        assert!(!validate_path("dir/../up"));
        assert!(!validate_path("dir/.."));
        assert!(!validate_path("has space"));
        assert!(!validate_path("per%cent"));
    }

    #[test]
    fn version_comparison() {
        use std::cmp::Ordering::*;
        assert_eq!(compare_versions("1.0", "1.0"), Equal);
        assert_eq!(compare_versions("1.0", "1.0.0"), Equal);
        assert_eq!(compare_versions("0.9", "1.0"), Less);
        assert_eq!(compare_versions("10", "9"), Greater);
        assert_eq!(compare_versions("266", "266.1"), Less);
        assert_eq!(compare_versions("1.2.3", "1.2"), Greater);
    }

    #[test]
    fn requires_checks() {
        assert_eq!(check_requires(&json!({}), "p", "266"), Ok(None));
        assert_eq!(
            check_requires(&json!({"requires": {"cockpit": "120"}}), "p", "266"),
            Ok(None)
        );
        let unavailable = check_requires(&json!({"requires": {"cockpit": "999"}}), "p", "266")
            .unwrap()
            .unwrap();
        assert!(unavailable.contains("999"));
        let unavailable = check_requires(&json!({"requires": {"frobnicator": "1"}}), "p", "266")
            .unwrap()
            .unwrap();
        assert!(unavailable.contains("not compatible"));
        assert!(check_requires(&json!({"requires": 5}), "p", "266").is_err());
    }

    #[test]
    fn manifest_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("test");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(
            pkg.join("manifest.json"),
            br#"{"version": "1", "tools": {"a": {"label": "A"}}, "exec": "${libexecdir}/helper"}"#,
        )
        .unwrap();
        std::fs::write(
            pkg.join("override.json"),
            br#"{"version": "2", "tools": {"a": null}}"#,
        )
        .unwrap();

        let manifest = read_manifest(
            &pkg,
            "test",
            &[],
            &dir.path().join("no-config"),
            Path::new("/usr/libexec"),
        )
        .unwrap();

        assert_eq!(manifest["version"], "2");
        assert_eq!(manifest["tools"], json!({}));
        assert_eq!(manifest["exec"], "/usr/libexec/helper");
    }

    #[test]
    fn manifest_user_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("test");
        let sys_conf = dir.path().join("sysconf");
        let user_conf = dir.path().join("userconf");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::create_dir_all(sys_conf.join("cockpit")).unwrap();
        std::fs::create_dir_all(user_conf.join("cockpit")).unwrap();

        std::fs::write(pkg.join("manifest.json"), br#"{"priority": 1}"#).unwrap();
        std::fs::write(
            sys_conf.join("cockpit/test.override.json"),
            br#"{"priority": 5}"#,
        )
        .unwrap();
        std::fs::write(
            user_conf.join("cockpit/test.override.json"),
            br#"{"priority": 9}"#,
        )
        .unwrap();

        let manifest = read_manifest(
            &pkg,
            "test",
            &[sys_conf],
            &user_conf,
            Path::new("/usr/libexec"),
        )
        .unwrap();
        assert_eq!(manifest["priority"], 9);
    }

    #[test]
    fn malformed_override_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("test");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join("manifest.json"), br#"{"version": "1"}"#).unwrap();
        std::fs::write(pkg.join("override.json"), b"{ not json").unwrap();

        let manifest = read_manifest(
            &pkg,
            "test",
            &[],
            &dir.path().join("no-config"),
            Path::new("/l"),
        )
        .unwrap();
        assert_eq!(manifest["version"], "1");
    }
}
