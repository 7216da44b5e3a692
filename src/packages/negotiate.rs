//! Content negotiation for served package files: language variants,
//! gzip siblings and content types.

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Parse an `Accept-Language` header into an ordered list of language
/// tags: split on commas, trimmed, lowercased, quality weights
/// stripped.
pub fn parse_accept_language(header: Option<&str>) -> Vec<String> {
    let header = match header {
        Some(header) => header,
        None => return Vec::new(),
    };

    header
        .split(',')
        .map(|entry| {
            entry
                .split(';')
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase()
        })
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// The result of negotiating a file on disk.
#[derive(Debug, PartialEq)]
pub struct Negotiated {
    pub path: PathBuf,
    pub gzipped: bool,
    pub language_specific: bool,
}

fn candidate_exists(candidate: &Path, paths: Option<&HashSet<PathBuf>>) -> bool {
    match paths {
        // Only files seen at scan time are served for checksummed
        // packages.
        Some(paths) => paths.contains(candidate),
        None => candidate.is_file(),
    }
}

/// Find the best on-disk variant of `filename` for `language`.
///
/// For a language `ll-rr`, the candidates are `base.ll-rr.ext`,
/// `base.ll.ext`, then the plain `base.ext`; each candidate may also
/// exist as a `.gz` sibling.
pub fn negotiate(
    filename: &Path,
    paths: Option<&HashSet<PathBuf>>,
    language: Option<&str>,
) -> Option<Negotiated> {
    let name = filename.file_name()?.to_string_lossy().into_owned();
    let parent = filename.parent()?;

    let (base, ext) = match name.rfind('.') {
        Some(dot) => (&name[..dot], Some(&name[dot + 1..])),
        None => (&name[..], None),
    };

    let mut variants: Vec<(String, bool)> = Vec::new();
    if let Some(language) = language {
        let language = language.to_ascii_lowercase();
        let mut languages = vec![language.clone()];
        if let Some((bare, _region)) = language.split_once('-') {
            languages.push(bare.to_string());
        }
        for lang in languages {
            let variant = match ext {
                Some(ext) => format!("{}.{}.{}", base, lang, ext),
                None => format!("{}.{}", base, lang),
            };
            variants.push((variant, true));
        }
    }
    variants.push((name.clone(), false));

    for (variant, language_specific) in variants {
        let candidate = parent.join(&variant);
        if candidate_exists(&candidate, paths) {
            return Some(Negotiated {
                path: candidate,
                gzipped: false,
                language_specific,
            });
        }

        let gz = parent.join(format!("{}.gz", variant));
        if candidate_exists(&gz, paths) {
            return Some(Negotiated {
                path: gz,
                gzipped: true,
                language_specific,
            });
        }
    }

    None
}

/// Decompress gzip content served to a client that didn't ask for it.
pub fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Content types by file extension.
pub fn content_type(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?;
    let kind = match ext.to_ascii_lowercase().as_str() {
        "css" => "text/css",
        "eot" => "application/vnd.ms-fontobject",
        "gif" => "image/gif",
        "html" | "htm" => "text/html",
        "ico" => "image/vnd.microsoft.icon",
        "jpg" | "jpeg" => "image/jpeg",
        "js" | "mjs" => "text/javascript",
        "json" | "map" => "application/json",
        "otf" => "font/otf",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "ttf" => "font/ttf",
        "txt" => "text/plain",
        "wasm" => "application/wasm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "xml" => "text/xml",
        _ => return None,
    };
    Some(kind)
}

/// Whether an `Accept-Encoding` header admits gzip.
pub fn accepts_gzip(header: Option<&str>) -> bool {
    match header {
        Some(header) => header
            .split(',')
            .map(|entry| entry.split(';').next().unwrap_or("").trim())
            .any(|encoding| encoding.eq_ignore_ascii_case("gzip") || encoding == "*"),
        None => false,
    }
}
