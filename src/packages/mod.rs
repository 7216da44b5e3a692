//! The package listing: discovery, checksums, resolution and the
//! internal HTTP server that exposes it.
//!
//! The agent reports a single checksum for the whole bundle of
//! packages; cockpit-ws makes routing decisions based on it, so once
//! reported it never changes for the lifetime of the agent, even when
//! packages change on disk. Each package manifest also carries a
//! `.checksum`: the oldest bundle checksum that included the exact
//! files of that package. A fresh or changed package gets the newest
//! bundle checksum, unchanged packages keep the one they had.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::secret::hex_encode;
use crate::{json as opt, Error, Result};

pub mod manifest;
pub mod negotiate;
mod serve;

/// The version packages compare their `requires.cockpit` against.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Where packages and their overrides are discovered.
#[derive(Debug, Clone)]
pub struct Config {
    /// Overrides the system data dirs and disables the user dir;
    /// used by tests.
    pub data_dirs: Option<Vec<PathBuf>>,
    pub user_data_dir: PathBuf,
    pub config_dirs: Vec<PathBuf>,
    pub user_config_dir: PathBuf,
    pub libexecdir: PathBuf,
}

impl Config {
    /// Discovery roots from the XDG environment.
    pub fn from_env() -> Config {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let home_join = |suffix: &str| {
            home.as_ref()
                .map(|home| home.join(suffix))
                .unwrap_or_else(|| PathBuf::from("/"))
        };

        let user_data_dir = std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_join(".local/share"));
        let user_config_dir = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_join(".config"));

        let split_dirs = |value: Option<std::ffi::OsString>, fallback: &str| -> Vec<PathBuf> {
            let value = value
                .map(|v| v.to_string_lossy().into_owned())
                .unwrap_or_else(|| fallback.to_string());
            value
                .split(':')
                .filter(|entry| !entry.is_empty())
                .map(PathBuf::from)
                .collect()
        };

        Config {
            data_dirs: None,
            user_data_dir,
            config_dirs: split_dirs(std::env::var_os("XDG_CONFIG_DIRS"), "/etc/xdg"),
            user_config_dir,
            libexecdir: PathBuf::from("/usr/libexec"),
        }
    }

    fn system_data_dirs(&self) -> Vec<PathBuf> {
        if let Some(ref dirs) = self.data_dirs {
            return dirs.clone();
        }
        let value = std::env::var("XDG_DATA_DIRS")
            .unwrap_or_else(|_| "/usr/local/share:/usr/share".to_string());
        value
            .split(':')
            .filter(|entry| !entry.is_empty())
            .map(PathBuf::from)
            .collect()
    }
}

/// One discovered package.
pub struct Package {
    pub name: String,
    pub directory: PathBuf,
    pub manifest: Value,
    /// Files seen at scan time; `None` for user packages, which are
    /// served straight from disk.
    pub paths: Option<Rc<HashSet<PathBuf>>>,
    pub unavailable: Option<String>,
    pub content_security_policy: Option<String>,
    pub own_checksum: Option<String>,
    pub bundle_checksum: Option<String>,
}

/// The subset of package state a request handler needs, cheap to
/// clone out of the listing so the borrow is not held across I/O.
#[derive(Clone)]
pub struct ResolvedPackage {
    pub name: String,
    pub paths: Option<Rc<HashSet<PathBuf>>>,
    pub unavailable: Option<String>,
    pub content_security_policy: Option<String>,
}

struct Inner {
    config: Config,
    listing: HashMap<String, Package>,
    /// The sticky reported checksum; set once, never changed.
    checksum: Option<String>,
    bundle_checksum: Option<String>,
    json: Value,
    reload_hint: bool,
    on_change: Option<Rc<dyn Fn()>>,
}

/// The package listing handle, shared by the router and the internal
/// HTTP server.
#[derive(Clone)]
pub struct Packages {
    inner: Rc<RefCell<Inner>>,
    address: SocketAddr,
}

impl Packages {
    /// Scan for packages and start the internal loopback server.
    pub async fn new(config: Config) -> Result<Packages> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(Error::new_io)?;
        let address = listener.local_addr().map_err(Error::new_io)?;

        let mut inner = Inner::new(config);
        inner.build();

        let packages = Packages {
            inner: Rc::new(RefCell::new(inner)),
            address,
        };

        tokio::task::spawn_local(serve::serve(listener, packages.clone()));

        Ok(packages)
    }

    /// The loopback address of the internal server.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The reported bundle checksum, if one is advertised.
    pub fn checksum(&self) -> Option<String> {
        self.inner.borrow().checksum.clone()
    }

    /// Names of the available packages, for the `init` message.
    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.borrow();
        let mut names: Vec<String> = inner
            .listing
            .values()
            .filter(|package| package.unavailable.is_none())
            .map(|package| package.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Every package name, sorted, for glob serving.
    pub(crate) fn all_names(&self) -> Vec<String> {
        let inner = self.inner.borrow();
        let mut names: Vec<String> = inner.listing.keys().cloned().collect();
        names.sort();
        names
    }

    /// The manifests JSON block, `.checksum` fields included.
    pub fn manifests(&self) -> Value {
        self.inner.borrow().json.clone()
    }

    /// Resolve a package-relative path to a file on disk.
    pub fn resolve(&self, name: &str, path: &str) -> Option<(ResolvedPackage, PathBuf)> {
        if !manifest::validate_path(path) {
            debug!("invalid 'path' used as a resource: {}", path);
            return None;
        }
        if !manifest::validate_name(name) {
            debug!("invalid 'package' name: {}", name);
            return None;
        }

        let inner = self.inner.borrow();
        let package = match inner.listing.get(name) {
            Some(package) => package,
            None => {
                debug!("resource package was not found: {}", name);
                return None;
            }
        };

        let resolved = ResolvedPackage {
            name: package.name.clone(),
            paths: package.paths.clone(),
            unavailable: package.unavailable.clone(),
            content_security_policy: package.content_security_policy.clone(),
        };
        Some((resolved, package.directory.join(path)))
    }

    /// The `bridges` rule objects from every manifest, strongest
    /// package priority first.
    pub fn bridges(&self) -> Vec<Value> {
        let inner = self.inner.borrow();

        let mut packages: Vec<&Package> = inner.listing.values().collect();
        packages.sort_by(|a, b| {
            manifest::priority(&b.manifest)
                .partial_cmp(&manifest::priority(&a.manifest))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });

        let mut result = Vec::new();
        for package in packages {
            let bridges = match opt::get_array(&package.manifest, "bridges") {
                Ok(Some(bridges)) => bridges,
                Ok(None) => continue,
                Err(_) => {
                    warn!("{}: invalid \"bridges\" field in package manifest", package.name);
                    continue;
                }
            };

            for item in bridges {
                if !item.is_object() {
                    warn!(
                        "{}: invalid bridge in \"bridges\" field in package manifest",
                        package.name
                    );
                    continue;
                }
                if opt::get_strv(item, "spawn").is_err() {
                    warn!("{}: invalid \"spawn\" field in package manifest", package.name);
                    continue;
                }
                if opt::get_strv(item, "environ").is_err() {
                    warn!("{}: invalid \"environ\" field in package manifest", package.name);
                    continue;
                }
                let matches = match opt::get_object(item, "match") {
                    Ok(matches) => matches,
                    Err(_) => {
                        warn!("{}: invalid \"match\" field in package manifest", package.name);
                        continue;
                    }
                };
                let privileged = match opt::get_bool(item, "privileged") {
                    Ok(privileged) => privileged.unwrap_or(false),
                    Err(_) => {
                        warn!(
                            "{}: invalid \"privileged\" field in package manifest",
                            package.name
                        );
                        continue;
                    }
                };
                if matches.is_none() != privileged {
                    warn!(
                        "{}: exactly one of \"match\" or \"privileged\" required",
                        package.name
                    );
                    continue;
                }
                if opt::get_str(item, "problem").is_err() {
                    warn!("{}: invalid \"problem\" field in package manifest", package.name);
                    continue;
                }
                result.push(item.clone());
            }
        }

        result
    }

    /// Rescan the package directories and notify the observer.
    pub fn reload(&self) {
        self.inner.borrow_mut().build();
        let on_change = self.inner.borrow().on_change.clone();
        if let Some(on_change) = on_change {
            on_change();
        }
    }

    /// A debounced reload: the first hint arms, later hints reload.
    pub fn reload_hint(&self) {
        let armed = {
            let mut inner = self.inner.borrow_mut();
            let armed = inner.reload_hint;
            inner.reload_hint = true;
            armed
        };
        if armed {
            self.reload();
        }
    }

    /// Register the single change observer.
    pub fn on_change<F: Fn() + 'static>(&self, callback: F) {
        self.inner.borrow_mut().on_change = Some(Rc::new(callback));
    }

    #[cfg(test)]
    pub(crate) fn new_offline(config: Config) -> Packages {
        let mut inner = Inner::new(config);
        inner.build();
        Packages {
            inner: Rc::new(RefCell::new(inner)),
            address: ([127, 0, 0, 1], 0).into(),
        }
    }
}

impl Inner {
    fn new(config: Config) -> Inner {
        Inner {
            config,
            listing: HashMap::new(),
            checksum: None,
            bundle_checksum: None,
            json: Value::Object(Map::new()),
            reload_hint: false,
            on_change: None,
        }
    }

    fn build(&mut self) {
        let old_listing = std::mem::take(&mut self.listing);
        self.bundle_checksum = None;

        let mut bundle = Some(Sha256::new());

        // User packages first; if any is installed, no checksum is
        // advertised for the lifetime of the agent.
        if self.config.data_dirs.is_none() {
            let directory = self.config.user_data_dir.join("cockpit");
            if directory.is_dir() {
                for name in sorted_dir_names(&directory) {
                    if maybe_add_package(
                        &mut self.listing,
                        &old_listing,
                        &directory,
                        &name,
                        &mut bundle,
                        false,
                        &self.config,
                    ) {
                        bundle = None;
                    }
                }
            }
        }

        for parent in self.config.system_data_dirs() {
            let directory = parent.join("cockpit");
            if directory.is_dir() {
                for name in sorted_dir_names(&directory) {
                    maybe_add_package(
                        &mut self.listing,
                        &old_listing,
                        &directory,
                        &name,
                        &mut bundle,
                        true,
                        &self.config,
                    );
                }
            }
        }

        if let Some(bundle) = bundle {
            let checksum = hex_encode(&bundle.finalize());
            self.bundle_checksum = Some(checksum.clone());
            if self.checksum.is_none() {
                self.checksum = Some(checksum);
            }
        }

        // Build the JSON manifests block and fix up checksums.
        let mut root = Map::new();
        if let Some(ref checksum) = self.checksum {
            root.insert(".checksum".into(), Value::String(checksum.clone()));
        }
        for package in self.listing.values_mut() {
            if package.bundle_checksum.is_none() {
                package.bundle_checksum = self.bundle_checksum.clone();
            }
            if let Some(ref bundle_checksum) = package.bundle_checksum {
                if let Some(object) = package.manifest.as_object_mut() {
                    object.insert(
                        ".checksum".into(),
                        Value::String(bundle_checksum.clone()),
                    );
                }
            }
            root.insert(package.name.clone(), package.manifest.clone());
        }
        self.json = Value::Object(root);
    }
}

fn sorted_dir_names(directory: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("couldn't list directory: {}: {}", directory.display(), err);
            return Vec::new();
        }
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Feed one file into the package and bundle checksums:
/// `<relative-path>\0<file-sha256-hex>\0`, null terminators included
/// so the values cannot have a boundary discrepancy.
fn walk_file(
    own: &mut Option<Sha256>,
    bundle: &mut Option<Sha256>,
    paths: &mut Option<HashSet<PathBuf>>,
    root: &Path,
    filename: &str,
) -> bool {
    // Invalid names are skipped here and refused at serve time.
    if !manifest::validate_path(filename) {
        debug!("package has an invalid path name: {}", filename);
        return true;
    }

    let path = root.join(filename);
    if path.is_dir() {
        return walk_directory(own, bundle, paths, root, Some(filename));
    }

    if own.is_some() {
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("couldn't open file: {}: {}", path.display(), err);
                return false;
            }
        };
        let digest = hex_encode(&Sha256::digest(&bytes));

        for checksum in [own.as_mut(), bundle.as_mut()].into_iter().flatten() {
            checksum.update(filename.as_bytes());
            checksum.update(b"\0");
            checksum.update(digest.as_bytes());
            checksum.update(b"\0");
        }
    }

    if let Some(paths) = paths {
        paths.insert(path);
    }

    true
}

fn walk_directory(
    own: &mut Option<Sha256>,
    bundle: &mut Option<Sha256>,
    paths: &mut Option<HashSet<PathBuf>>,
    root: &Path,
    directory: Option<&str>,
) -> bool {
    let path = match directory {
        Some(directory) => root.join(directory),
        None => root.to_path_buf(),
    };

    for name in sorted_dir_names(&path) {
        let filename = match directory {
            Some(directory) => format!("{}/{}", directory, name),
            None => name,
        };
        if !walk_file(own, bundle, paths, root, &filename) {
            return false;
        }
    }

    true
}

fn maybe_add_package(
    listing: &mut HashMap<String, Package>,
    old_listing: &HashMap<String, Package>,
    parent: &Path,
    name: &str,
    bundle: &mut Option<Sha256>,
    system: bool,
    config: &Config,
) -> bool {
    let path = parent.join(name);

    let manifest_value = match manifest::read_manifest(
        &path,
        name,
        &config.config_dirs,
        &config.user_config_dir,
        &config.libexecdir,
    ) {
        Some(manifest) => manifest,
        None => return false,
    };

    // The manifest may override the directory name.
    let name = match manifest::package_name(&manifest_value, name) {
        Some(name) => name.to_string(),
        None => return false,
    };

    if let Some(existing) = listing.get(&name) {
        // Higher priority wins; a tie keeps the first seen.
        if manifest::priority(&manifest_value) <= manifest::priority(&existing.manifest) {
            return false;
        }
    }

    let directory = match manifest::base_directory(&manifest_value, &name, &path) {
        Some(directory) => directory,
        None => return false,
    };

    let mut paths = system.then(HashSet::new);
    let mut own = bundle.as_ref().map(|_| Sha256::new());

    if own.is_some() || paths.is_some() {
        if !walk_directory(&mut own, bundle, &mut paths, &directory, None) {
            return false;
        }
    }

    let mut manifest_value = manifest_value;
    let own_checksum = own.map(|mut own| {
        // The whole final manifest is digested too, overrides and all.
        let serialized = serde_json::to_vec(&manifest_value).expect("manifest serializes");
        own.update(&serialized);
        if let Some(bundle) = bundle.as_mut() {
            bundle.update(&serialized);
        }
        hex_encode(&own.finalize())
    });

    // Keep the old bundle checksum when none of the files changed.
    let mut bundle_checksum = None;
    if let Some(old_package) = old_listing.get(&name) {
        if old_package.bundle_checksum.is_some()
            && old_package.own_checksum.is_some()
            && old_package.own_checksum == own_checksum
        {
            bundle_checksum = old_package.bundle_checksum.clone();
        }
    }

    let unavailable = match manifest::check_requires(&manifest_value, &name, VERSION) {
        Ok(unavailable) => unavailable,
        Err(()) => return false,
    };

    let content_security_policy = match opt::get_str(&manifest_value, "content-security-policy") {
        Ok(policy) => {
            if let Some(policy) = policy {
                if !manifest::is_header_value(policy) {
                    warn!("{}: invalid content-security-policy: {}", name, policy);
                    return false;
                }
            }
            policy.map(str::to_owned)
        }
        Err(_) => {
            warn!("{}: invalid content-security-policy", name);
            return false;
        }
    };
    if let Some(object) = manifest_value.as_object_mut() {
        object.remove("content-security-policy");
    }

    debug!("{}: added package at {}", name, directory.display());

    listing.insert(
        name.clone(),
        Package {
            name,
            directory,
            manifest: manifest_value,
            paths: paths.map(Rc::new),
            unavailable,
            content_security_policy,
            own_checksum,
            bundle_checksum,
        },
    );

    true
}

/// `--packages`: print the listing to stdout and return.
pub fn dump(config: Config) {
    let mut inner = Inner::new(config);
    inner.build();

    let mut names: Vec<&String> = inner.listing.keys().collect();
    names.sort();

    for name in names {
        let package = &inner.listing[name];
        let mut labels = Vec::new();
        for key in ["menu", "tools"] {
            if let Some(Value::Object(menu)) = package.manifest.get(key) {
                for item in menu.values() {
                    if let Some(label) = item.get("label").and_then(Value::as_str) {
                        labels.push(label.to_string());
                    }
                }
            }
        }
        println!(
            "{:20.20} {:40.40} {}",
            package.name,
            labels.join(", "),
            package.directory.display()
        );
    }

    if let Some(checksum) = inner.checksum {
        println!("checksum = {}", checksum);
    }
}
