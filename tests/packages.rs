//! End-to-end tests for the internal package server, over real HTTP
//! on the loopback listener.

mod support;

use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::task::LocalSet;

use cockpit_bridge::packages::{Config, Packages};
use support::{header, http_get};

fn write_package(root: &Path, name: &str, manifest: &str, files: &[(&str, &[u8])]) {
    let dir = root.join("cockpit").join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("manifest.json"), manifest).unwrap();
    for (file, contents) in files {
        let path = dir.join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }
}

fn test_config(system: &Path) -> Config {
    Config {
        data_dirs: Some(vec![system.to_path_buf()]),
        user_data_dir: PathBuf::from("/nonexistent"),
        config_dirs: vec![],
        user_config_dir: PathBuf::from("/nonexistent"),
        libexecdir: PathBuf::from("/usr/libexec"),
    }
}

#[tokio::test]
async fn checksum_and_manifests_routes() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            write_package(dir.path(), "test", r#"{"description": "a test"}"#, &[]);

            let packages = Packages::new(test_config(dir.path())).await.unwrap();
            let checksum = packages.checksum().unwrap();

            let (status, headers, body) = http_get(packages.address(), "/checksum", &[]).await;
            assert_eq!(status, 200);
            assert_eq!(String::from_utf8_lossy(&body), checksum);
            assert_eq!(header(&headers, "X-Cockpit-Pkg-Checksum"), Some(&checksum[..]));

            let (status, headers, body) =
                http_get(packages.address(), "/manifests.json", &[]).await;
            assert_eq!(status, 200);
            assert_eq!(header(&headers, "Content-Type"), Some("application/json"));
            assert_eq!(
                header(&headers, "ETag").unwrap(),
                format!("\"${}\"", checksum)
            );
            let manifests: Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(manifests[".checksum"], Value::String(checksum.clone()));
            assert_eq!(manifests["test"]["description"], "a test");
            assert_eq!(manifests["test"][".checksum"], Value::String(checksum));

            let (status, _, body) = http_get(packages.address(), "/manifests.js", &[]).await;
            assert_eq!(status, 200);
            let text = String::from_utf8_lossy(&body);
            assert!(text.starts_with("(function (root, data) {"));
            assert!(text.ends_with("));"));
        })
        .await;
}

#[tokio::test]
async fn security_headers_on_every_response() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            write_package(dir.path(), "test", r#"{}"#, &[]);

            let packages = Packages::new(test_config(dir.path())).await.unwrap();
            let (_, headers, _) = http_get(packages.address(), "/checksum", &[]).await;

            assert_eq!(header(&headers, "X-DNS-Prefetch-Control"), Some("off"));
            assert_eq!(header(&headers, "Referrer-Policy"), Some("no-referrer"));
            assert_eq!(header(&headers, "X-Content-Type-Options"), Some("nosniff"));
            assert_eq!(
                header(&headers, "Cross-Origin-Resource-Policy"),
                Some("same-origin")
            );
            assert_eq!(header(&headers, "X-Frame-Options"), Some("sameorigin"));
        })
        .await;
}

#[tokio::test]
async fn file_serving_and_locale() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            write_package(
                dir.path(),
                "another",
                r#"{}"#,
                &[
                    ("test.html", b"plain"),
                    ("test.pig.html", b"pig content"),
                ],
            );

            let packages = Packages::new(test_config(dir.path())).await.unwrap();

            // Plain fetch.
            let (status, headers, body) =
                http_get(packages.address(), "/another/test.html", &[]).await;
            assert_eq!(status, 200);
            assert_eq!(body, b"plain");
            assert_eq!(header(&headers, "Content-Type"), Some("text/html"));
            assert!(header(&headers, "Cache-Control").is_none());

            // Locale negotiation picks the pig variant, uncacheable.
            let (status, headers, body) = http_get(
                packages.address(),
                "/another/test.html",
                &[("Accept-Language", "pig")],
            )
            .await;
            assert_eq!(status, 200);
            assert_eq!(body, b"pig content");
            assert_eq!(header(&headers, "Cache-Control"), Some("no-cache"));

            // A region-specific request falls back to the bare
            // language when no regional file exists.
            let (status, _, body) = http_get(
                packages.address(),
                "/another/test.html",
                &[("Accept-Language", "pig-pen")],
            )
            .await;
            assert_eq!(status, 200);
            assert_eq!(body, b"pig content");

            // Unknown files and packages are 404.
            let (status, _, _) =
                http_get(packages.address(), "/another/missing.html", &[]).await;
            assert_eq!(status, 404);
            let (status, _, _) = http_get(packages.address(), "/nope/test.html", &[]).await;
            assert_eq!(status, 404);

            // Path escapes are refused.
            let (status, _, _) =
                http_get(packages.address(), "/another/../../etc/passwd", &[]).await;
            assert_eq!(status, 404);
        })
        .await;
}

#[tokio::test]
async fn gzip_negotiation() {
    LocalSet::new()
        .run_until(async {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(b"compressed contents").unwrap();
            let compressed = encoder.finish().unwrap();

            let dir = tempfile::tempdir().unwrap();
            write_package(
                dir.path(),
                "zipped",
                r#"{}"#,
                &[("script.js.gz", &compressed)],
            );

            let packages = Packages::new(test_config(dir.path())).await.unwrap();

            // A gzip-capable client gets the compressed bytes.
            let (status, headers, body) = http_get(
                packages.address(),
                "/zipped/script.js",
                &[("Accept-Encoding", "gzip")],
            )
            .await;
            assert_eq!(status, 200);
            assert_eq!(header(&headers, "Content-Encoding"), Some("gzip"));
            assert_eq!(body, compressed);

            // Anyone else gets it decompressed transparently.
            let (status, headers, body) =
                http_get(packages.address(), "/zipped/script.js", &[]).await;
            assert_eq!(status, 200);
            assert!(header(&headers, "Content-Encoding").is_none());
            assert_eq!(body, b"compressed contents");
        })
        .await;
}

#[tokio::test]
async fn globbed_content_concatenates() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            write_package(dir.path(), "alpha", r#"{}"#, &[("part.js", b"alpha;")]);
            write_package(dir.path(), "beta", r#"{}"#, &[("part.js", b"beta;")]);
            write_package(dir.path(), "gamma", r#"{}"#, &[("other.js", b"gamma;")]);

            let packages = Packages::new(test_config(dir.path())).await.unwrap();

            let (status, headers, body) = http_get(
                packages.address(),
                "/*/part.js",
                &[("Accept-Encoding", "gzip")],
            )
            .await;
            assert_eq!(status, 200);
            // Globbing never negotiates gzip and is never cacheable.
            assert!(header(&headers, "Content-Encoding").is_none());
            assert_eq!(header(&headers, "Cache-Control"), Some("no-cache"));
            // Packages concatenate in name order; gamma has no such
            // file and contributes an empty block.
            assert_eq!(String::from_utf8_lossy(&body), "alpha;beta;");
        })
        .await;
}

#[tokio::test]
async fn csp_and_forwarded_origin() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            write_package(
                dir.path(),
                "secure",
                r#"{"content-security-policy": "default-src 'self'"}"#,
                &[("page.html", b"<html/>")],
            );

            let packages = Packages::new(test_config(dir.path())).await.unwrap();

            let (status, headers, _) = http_get(
                packages.address(),
                "/secure/page.html",
                &[
                    ("X-Forwarded-Proto", "https"),
                    ("X-Forwarded-Host", "host.example:9090"),
                ],
            )
            .await;
            assert_eq!(status, 200);
            assert_eq!(
                header(&headers, "Content-Security-Policy"),
                Some("default-src 'self' https://host.example:9090")
            );
            assert_eq!(
                header(&headers, "Access-Control-Allow-Origin"),
                Some("https://host.example:9090")
            );
        })
        .await;
}

#[tokio::test]
async fn missing_po_js_serves_empty() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            write_package(dir.path(), "translated", r#"{}"#, &[("index.js", b"code")]);

            let packages = Packages::new(test_config(dir.path())).await.unwrap();

            let (status, headers, body) = http_get(
                packages.address(),
                "/translated/po.js",
                &[("Accept-Language", "de")],
            )
            .await;
            assert_eq!(status, 200);
            assert!(body.is_empty());
            assert_eq!(header(&headers, "Cache-Control"), Some("no-cache"));
        })
        .await;
}

#[tokio::test]
async fn unavailable_package_is_503() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            write_package(
                dir.path(),
                "future",
                r#"{"requires": {"cockpit": "99999"}}"#,
                &[("app.js", b"code")],
            );

            let packages = Packages::new(test_config(dir.path())).await.unwrap();

            let (status, _, body) = http_get(packages.address(), "/future/app.js", &[]).await;
            assert_eq!(status, 503);
            assert!(String::from_utf8_lossy(&body).contains("99999"));
        })
        .await;
}

#[tokio::test]
async fn http_channel_reaches_internal_server() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            write_package(dir.path(), "pkg", r#"{}"#, &[("app.js", b"var x = 1;")]);

            let packages = Packages::new(test_config(dir.path())).await.unwrap();
            let mut peer = support::start_agent(Some(packages));
            peer.init().await;

            peer.send_control(serde_json::json!({
                "command": "open", "channel": "i1", "payload": "http-stream2",
                "method": "GET", "path": "/pkg/app.js", "internal": "packages",
            }))
            .await;
            peer.send_control(serde_json::json!({"command": "done", "channel": "i1"}))
                .await;

            let (head, blocks) = peer.collect_http_response("i1").await;
            assert_eq!(head["status"], 200);
            let body: Vec<u8> = blocks.iter().flat_map(|b| b.iter().copied()).collect();
            assert_eq!(body, b"var x = 1;");
        })
        .await;
}
