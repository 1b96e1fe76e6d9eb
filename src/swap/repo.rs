// src/swap/repo.rs

//! Local swap repository
//!
//! Layout under the web root:
//!
//! ```text
//! index.html                      landing page for browsers
//! fdroid/index.html               copies of the landing page so it is
//! fdroid/repo/index.html          found from any directory
//! fdroid/repo/<pkg>_<vc>.apk      symlinks to the shared packages
//! fdroid/repo/icons/<pkg>_<vc>.png
//! fdroid/repo/index-v1.jar        signed index
//! FDROID/REPO/                    for QR scanners that upper-case URLs
//! ```
//!
//! `index-v1.jar` is a tar archive of `index-v1.json`, its detached signature
//! and the signer certificate. It is assembled in a temp file and renamed into
//! place, so a failed signing run leaves the previous archive being served.

use super::keystore::{KeyStore, certificate_fingerprint, verify_signature};
use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, hash_file};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Repository path relative to the web root, as advertised to peers
pub const REPO_PATH: &str = "/fdroid/repo";

pub const SIGNED_FILE_NAME: &str = "index-v1.jar";
pub const DATA_FILE_NAME: &str = "index-v1.json";
pub const SIGNATURE_FILE_NAME: &str = "index-v1.json.sig";
pub const CERTIFICATE_FILE_NAME: &str = "index-v1.cert.pem";

const INDEX_VERSION: u32 = 20001;
const MAX_AGE_DAYS: u32 = 7;
const FALLBACK_CLIENT_URL: &str = "https://f-droid.org/F-Droid.apk";
const CLIENT_FILE_NAME: &str = "F-Droid.apk";

const INDEX_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Swap</title>
</head>
<body>
<h1>Swap apps</h1>
<p>1. <a href="{{CLIENT_URL}}">Download the F-Droid client</a> and install it.</p>
<p>2. Add this repository: <a href="{{REPO_URL}}">{{REPO_URL}}</a></p>
<ul>
{{APP_LIST}}</ul>
</body>
</html>
"#;

// =============================================================================
// Index model
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoV1 {
    pub timestamp: i64,
    pub version: u32,
    pub maxage: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub address: String,
    pub description: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppV1 {
    pub package_name: String,
    pub name: String,
    pub suggested_version_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub added: i64,
    pub last_updated: i64,
    pub license: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageV1 {
    pub package_name: String,
    pub version_code: u64,
    pub version_name: String,
    pub apk_name: String,
    pub hash: String,
    pub hash_type: String,
    pub size: u64,
    pub added: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requests {
    #[serde(default)]
    pub install: Vec<String>,
    #[serde(default)]
    pub uninstall: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexV1 {
    pub repo: RepoV1,
    #[serde(default)]
    pub requests: Requests,
    pub apps: Vec<AppV1>,
    pub packages: BTreeMap<String, Vec<PackageV1>>,
}

/// One package offered for swapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapApp {
    pub package_name: String,
    pub name: String,
    pub version_code: u64,
    pub version_name: String,
    pub apk: PathBuf,
    pub icon: Option<PathBuf>,
}

impl SwapApp {
    pub fn new(package_name: &str, apk: impl Into<PathBuf>) -> Self {
        Self {
            package_name: package_name.to_string(),
            name: package_name.to_string(),
            version_code: 1,
            version_name: "1".to_string(),
            apk: apk.into(),
            icon: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_version(mut self, code: u64, name: &str) -> Self {
        self.version_code = code;
        self.version_name = name.to_string();
        self
    }

    pub fn with_icon(mut self, icon: impl Into<PathBuf>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    /// `<package>_<versionCode>`, the stem of the served files
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.package_name, self.version_code)
    }
}

// =============================================================================
// Repository
// =============================================================================

/// What the repository currently publishes
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub apps: Vec<SwapApp>,
    pub address: String,
    pub name: String,
}

#[derive(Debug)]
pub struct LocalRepo {
    web_root: PathBuf,
    fdroid_dir: PathBuf,
    repo_dir: PathBuf,
    client_apk: Option<PathBuf>,
    snapshot: Snapshot,
}

impl LocalRepo {
    /// Create the `fdroid/repo/icons` skeleton under `web_root`
    pub fn new(web_root: impl Into<PathBuf>) -> Result<Self> {
        let web_root = web_root.into();
        let fdroid_dir = web_root.join("fdroid");
        let repo_dir = fdroid_dir.join("repo");
        fs::create_dir_all(repo_dir.join("icons"))
            .map_err(|e| Error::from_io(&repo_dir.display().to_string(), e))?;
        Ok(Self {
            web_root,
            fdroid_dir,
            repo_dir,
            client_apk: None,
            snapshot: Snapshot::default(),
        })
    }

    /// Offer this client package from the landing page
    pub fn with_client_apk(mut self, apk: impl Into<PathBuf>) -> Self {
        self.client_apk = Some(apk.into());
        self
    }

    pub fn web_root(&self) -> &Path {
        &self.web_root
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    pub fn index_jar(&self) -> PathBuf {
        self.repo_dir.join(SIGNED_FILE_NAME)
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Publish `apps` at `address`, signing the index with `keystore`
    pub fn generate(
        &mut self,
        keystore: &KeyStore,
        address: &str,
        repo_name: &str,
        host: &str,
        apps: &[SwapApp],
    ) -> Result<IndexV1> {
        let name = format!("{repo_name} on {host}");
        info!("[swap] Generating repo '{}' with {} apps", name, apps.len());

        self.clear_published()?;

        let now = chrono::Utc::now().timestamp_millis();
        let mut index = IndexV1 {
            repo: RepoV1 {
                timestamp: now,
                version: INDEX_VERSION,
                maxage: MAX_AGE_DAYS,
                name: name.clone(),
                icon: None,
                address: address.to_string(),
                description: format!(
                    "A local FDroid repo generated from apps installed on {repo_name}"
                ),
                mirrors: Vec::new(),
            },
            requests: Requests::default(),
            apps: Vec::new(),
            packages: BTreeMap::new(),
        };

        for app in apps {
            let (app_entry, package) = self.publish_app(app, now)?;
            index.apps.push(app_entry);
            index
                .packages
                .entry(app.package_name.clone())
                .or_default()
                .push(package);
        }

        let json = serde_json::to_vec_pretty(&index)?;
        let json_path = self.repo_dir.join(DATA_FILE_NAME);
        fs::write(&json_path, &json)?;

        self.write_index_page(address, apps)?;
        let signed = self.write_signed_index(keystore, &json);
        if let Err(e) = fs::remove_file(&json_path) {
            debug!("[swap] Could not remove {}: {}", json_path.display(), e);
        }
        signed?;

        self.snapshot = Snapshot {
            apps: apps.to_vec(),
            address: address.to_string(),
            name,
        };
        Ok(index)
    }

    /// Unlink packages and icons of the previous selection
    ///
    /// The signed index stays until its replacement is renamed into place.
    fn clear_published(&self) -> Result<()> {
        let icons = self.repo_dir.join("icons");
        for dir in [&self.repo_dir, &icons] {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::from_io(&dir.display().to_string(), e)),
            };
            for entry in entries {
                let path = entry?.path();
                let stale = if *dir == icons {
                    !path.is_dir()
                } else {
                    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("apk"))
                };
                if stale {
                    debug!("[swap] Removing {}", path.display());
                    fs::remove_file(&path)
                        .map_err(|e| Error::from_io(&path.display().to_string(), e))?;
                }
            }
        }
        fs::create_dir_all(&icons).map_err(|e| Error::from_io(&icons.display().to_string(), e))?;
        Ok(())
    }

    fn publish_app(&self, app: &SwapApp, now: i64) -> Result<(AppV1, PackageV1)> {
        let apk_name = format!("{}.apk", app.file_stem());
        let served = self.repo_dir.join(&apk_name);
        symlink_or_copy(&app.apk, &served)?;

        let icon = match &app.icon {
            Some(icon) => {
                let icon_name = format!("{}.png", app.file_stem());
                match symlink_or_copy(icon, &self.repo_dir.join("icons").join(&icon_name)) {
                    Ok(()) => Some(icon_name),
                    Err(e) => {
                        warn!("[swap] Skipping icon for {}: {}", app.package_name, e);
                        None
                    }
                }
            }
            None => None,
        };

        let hash = hash_file(HashAlgorithm::Sha256, &app.apk)
            .map_err(|e| Error::from_io(&app.apk.display().to_string(), e))?;
        let size = fs::metadata(&app.apk)?.len();

        Ok((
            AppV1 {
                package_name: app.package_name.clone(),
                name: app.name.clone(),
                suggested_version_code: app.version_code.to_string(),
                icon,
                added: now,
                last_updated: now,
                license: "Unknown".to_string(),
            },
            PackageV1 {
                package_name: app.package_name.clone(),
                version_code: app.version_code,
                version_name: app.version_name.clone(),
                apk_name,
                hash: hash.as_str().to_string(),
                hash_type: HashAlgorithm::Sha256.name().to_string(),
                size,
                added: now,
            },
        ))
    }

    fn client_url(&self) -> String {
        let Some(apk) = &self.client_apk else {
            return FALLBACK_CLIENT_URL.to_string();
        };
        let link = self.fdroid_dir.join(CLIENT_FILE_NAME);
        match symlink_or_copy(apk, &link) {
            Ok(()) => format!("/fdroid/{CLIENT_FILE_NAME}"),
            Err(e) => {
                warn!("[swap] Could not place client apk: {}", e);
                FALLBACK_CLIENT_URL.to_string()
            }
        }
    }

    /// Landing page plus its copies in every directory a browser may land in
    pub fn write_index_page(&self, repo_address: &str, apps: &[SwapApp]) -> Result<()> {
        let mut app_list = String::new();
        for app in apps {
            let stem = app.file_stem();
            app_list.push_str(&format!(
                "<li><a href=\"/fdroid/repo/{stem}.apk\"><img width=\"32\" height=\"32\" \
                 src=\"/fdroid/repo/icons/{stem}.png\">{}</a></li>\n",
                app.name
            ));
        }

        let page = INDEX_TEMPLATE
            .replace("{{REPO_URL}}", repo_address)
            .replace("{{CLIENT_URL}}", &self.client_url())
            .replace("{{APP_LIST}}", &app_list);
        let index_html = self.web_root.join("index.html");
        fs::write(&index_html, page)?;

        let fdroid_caps = self.web_root.join("FDROID");
        let repo_caps = fdroid_caps.join("REPO");
        fs::create_dir_all(&repo_caps)?;

        for dir in [&self.fdroid_dir, &self.repo_dir, &fdroid_caps, &repo_caps] {
            symlink_or_copy(&index_html, &dir.join("index.html"))?;
        }
        Ok(())
    }

    fn write_signed_index(&self, keystore: &KeyStore, json: &[u8]) -> Result<()> {
        let identity = keystore.index_identity()?;
        let signature = keystore.sign(json)?;
        let certificate = identity.certificate_pem();

        let mut tmp = tempfile::NamedTempFile::new_in(&self.repo_dir)?;
        {
            let mut archive = tar::Builder::new(tmp.as_file_mut());
            let mtime = chrono::Utc::now().timestamp().max(0) as u64;
            for (name, data) in [
                (DATA_FILE_NAME, json),
                (SIGNATURE_FILE_NAME, signature.as_slice()),
                (CERTIFICATE_FILE_NAME, certificate.as_bytes()),
            ] {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(data.len() as u64);
                header.set_mtime(mtime);
                header.set_cksum();
                archive.append_data(&mut header, name, data)?;
            }
            archive.finish()?;
        }
        tmp.as_file_mut().flush()?;
        tmp.as_file().sync_all()?;

        let target = self.index_jar();
        tmp.persist(&target)
            .map_err(|e| Error::IoError(format!("Failed to replace {}: {}", target.display(), e.error)))?;
        info!("[swap] Signed index written to {}", target.display());
        Ok(())
    }

    /// Remove every published file from the repo directory
    pub fn delete_repo(&mut self) -> Result<()> {
        if self.repo_dir.exists() {
            fs::remove_dir_all(&self.repo_dir)?;
        }
        fs::create_dir_all(self.repo_dir.join("icons"))?;
        self.snapshot = Snapshot::default();
        Ok(())
    }
}

/// Read and check a signed index archive
///
/// Returns the index together with the signer's fingerprint. When
/// `expected_fingerprint` is given the signer must match it.
pub fn verify_signed_index(path: &Path, expected_fingerprint: Option<&str>) -> Result<(IndexV1, String)> {
    let file = fs::File::open(path).map_err(|e| Error::from_io(&path.display().to_string(), e))?;
    let mut archive = tar::Archive::new(file);

    let mut entries: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        entries.insert(name, data);
    }

    let take = |name: &str| {
        entries
            .get(name)
            .ok_or_else(|| Error::ParseError(format!("{} missing from {}", name, path.display())))
    };
    let json = take(DATA_FILE_NAME)?;
    let signature = take(SIGNATURE_FILE_NAME)?;
    let certificate = pem::parse(take(CERTIFICATE_FILE_NAME)?)
        .map_err(|e| Error::ParseError(format!("Bad signer certificate: {e}")))?;

    verify_signature(certificate.contents(), json, signature)?;
    let fingerprint = certificate_fingerprint(certificate.contents());
    if let Some(expected) = expected_fingerprint
        && !expected.eq_ignore_ascii_case(&fingerprint)
    {
        return Err(Error::VerificationFailed {
            algorithm: "fingerprint".to_string(),
            expected: expected.to_ascii_lowercase(),
            actual: fingerprint,
        });
    }

    let index = serde_json::from_slice(json)?;
    Ok((index, fingerprint))
}

/// Symlink `target` at `link`, copying when links are unavailable
pub fn symlink_or_copy(target: &Path, link: &Path) -> Result<()> {
    if !target.exists() {
        return Err(Error::NotFound(target.display().to_string()));
    }
    if fs::symlink_metadata(link).is_ok() {
        fs::remove_file(link)?;
    }

    #[cfg(unix)]
    {
        let absolute = std::path::absolute(target)?;
        match std::os::unix::fs::symlink(&absolute, link) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("Symlink {} failed ({}), copying", link.display(), e),
        }
    }

    fs::copy(target, link).map_err(|e| Error::from_io(&link.display().to_string(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::webroot::{WebRequest, WebRoot};

    struct Fixture {
        _dir: tempfile::TempDir,
        keystore: KeyStore,
        repo: LocalRepo,
        apk: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let keystore = KeyStore::open(dir.path().join("swap.keystore")).unwrap();
        let repo = LocalRepo::new(dir.path().join("www")).unwrap();
        let apk = dir.path().join("example.apk");
        fs::write(&apk, b"not really an apk").unwrap();
        Fixture {
            _dir: dir,
            keystore,
            repo,
            apk,
        }
    }

    #[test]
    fn test_generate_signed_repo() {
        let mut fx = fixture();
        let app = SwapApp::new("org.example", &fx.apk)
            .with_name("Example")
            .with_version(42, "4.2");
        let index = fx
            .repo
            .generate(&fx.keystore, "http://192.168.1.5:8888/fdroid/repo", "phone", "192.168.1.5", &[app])
            .unwrap();

        assert_eq!(index.repo.name, "phone on 192.168.1.5");
        assert_eq!(index.packages["org.example"][0].apk_name, "org.example_42.apk");
        assert_eq!(
            index.packages["org.example"][0].hash,
            crate::hash::sha256(b"not really an apk")
        );

        let repo_dir = fx.repo.repo_dir().to_path_buf();
        assert_eq!(fs::read(repo_dir.join("org.example_42.apk")).unwrap(), b"not really an apk");
        assert!(!repo_dir.join(DATA_FILE_NAME).exists());

        let (verified, fingerprint) =
            verify_signed_index(&fx.repo.index_jar(), Some(&fx.keystore.fingerprint().unwrap())).unwrap();
        assert_eq!(verified, index);
        assert_eq!(fingerprint, fx.keystore.fingerprint().unwrap());
        assert_eq!(fx.repo.snapshot().apps.len(), 1);
    }

    #[test]
    fn test_deselected_app_is_unpublished() {
        let mut fx = fixture();
        let icon = fx.apk.with_file_name("b.png");
        fs::write(&icon, b"png").unwrap();
        let a = SwapApp::new("org.a", &fx.apk);
        let b = SwapApp::new("org.b", &fx.apk).with_icon(&icon);
        let address = "http://10.0.0.2:8888/fdroid/repo";

        fx.repo
            .generate(&fx.keystore, address, "tablet", "10.0.0.2", &[a.clone(), b])
            .unwrap();
        let web = WebRoot::new(fx.repo.web_root());
        let get = |path: &str| web.respond(&WebRequest::get(path)).status;
        assert_eq!(get("/fdroid/repo/org.b_1.apk"), 200);
        assert_eq!(get("/fdroid/repo/icons/org.b_1.png"), 200);

        let index = fx
            .repo
            .generate(&fx.keystore, address, "tablet", "10.0.0.2", &[a])
            .unwrap();
        assert_eq!(index.packages.keys().collect::<Vec<_>>(), ["org.a"]);
        assert_eq!(get("/fdroid/repo/org.a_1.apk"), 200);
        assert_eq!(get("/fdroid/repo/org.b_1.apk"), 404);
        assert_eq!(get("/fdroid/repo/icons/org.b_1.png"), 404);
        assert!(fx.repo.index_jar().exists());
    }

    #[test]
    fn test_landing_page_everywhere() {
        let mut fx = fixture();
        let app = SwapApp::new("org.example", &fx.apk).with_name("Example App");
        fx.repo
            .generate(&fx.keystore, "http://10.0.0.2:8888/fdroid/repo", "tablet", "10.0.0.2", &[app])
            .unwrap();

        let root = fx.repo.web_root().to_path_buf();
        let page = fs::read_to_string(root.join("index.html")).unwrap();
        assert!(page.contains("http://10.0.0.2:8888/fdroid/repo"));
        assert!(page.contains(FALLBACK_CLIENT_URL));
        assert!(page.contains("/fdroid/repo/org.example_1.apk"));
        assert!(page.contains("Example App"));
        for copy in ["fdroid/index.html", "fdroid/repo/index.html", "FDROID/REPO/index.html"] {
            assert_eq!(fs::read_to_string(root.join(copy)).unwrap(), page, "{copy}");
        }
    }

    #[test]
    fn test_wrong_fingerprint_rejected() {
        let mut fx = fixture();
        fx.repo
            .generate(&fx.keystore, "http://10.0.0.2:8888/fdroid/repo", "tablet", "10.0.0.2", &[])
            .unwrap();
        let err = verify_signed_index(&fx.repo.index_jar(), Some(&"0".repeat(64))).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::VerificationFailed);
    }

    #[test]
    fn test_tampered_index_rejected() {
        let mut fx = fixture();
        fx.repo
            .generate(&fx.keystore, "http://10.0.0.2:8888/fdroid/repo", "tablet", "10.0.0.2", &[])
            .unwrap();

        let jar = fx.repo.index_jar();
        let mut original = tar::Archive::new(fs::File::open(&jar).unwrap());
        let mut rebuilt = tar::Builder::new(Vec::new());
        for entry in original.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            if name == DATA_FILE_NAME {
                data = String::from_utf8(data).unwrap().replace("tablet", "mallory").into_bytes();
            }
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            rebuilt.append_data(&mut header, &name, data.as_slice()).unwrap();
        }
        fs::write(&jar, rebuilt.into_inner().unwrap()).unwrap();

        assert!(verify_signed_index(&jar, None).is_err());
    }

    #[test]
    fn test_missing_apk_keeps_previous_index() {
        let mut fx = fixture();
        fx.repo
            .generate(&fx.keystore, "http://10.0.0.2:8888/fdroid/repo", "tablet", "10.0.0.2", &[])
            .unwrap();
        let before = fs::read(fx.repo.index_jar()).unwrap();

        let missing = SwapApp::new("org.gone", "/nonexistent/gone.apk");
        assert!(fx
            .repo
            .generate(&fx.keystore, "http://10.0.0.2:8888/fdroid/repo", "tablet", "10.0.0.2", &[missing])
            .is_err());
        assert_eq!(fs::read(fx.repo.index_jar()).unwrap(), before);
    }
}
