//! End-to-end tests of the resolution engine against an in-memory registry.

use async_trait::async_trait;
use pypi_resolve::index::{RegistryClient, RegistryError, ReleaseMap, WheelMetadataError};
use pypi_resolve::resolve::{resolve_requirement, resolve_requirements};
use pypi_resolve::sdist::{SdistBuildError, SdistBuilder};
use pypi_resolve::types::{ArtifactInfo, CoreMetadata, NormalizedPackageName, VersionMetadata};
use pypi_resolve::{
    MarkerEnvironment, Requirement, Resolution, ResolveError, ResolveOptions, Version,
    VersionSpecifiers,
};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

fn requirement(s: &str) -> Requirement {
    Requirement::from_str(s).unwrap()
}

fn requires_python(s: &str) -> VersionSpecifiers {
    VersionSpecifiers::from_str(s).unwrap()
}

fn wheel_file(name: &str, version: &str) -> ArtifactInfo {
    ArtifactInfo {
        filename: format!("{}-{}-py3-none-any.whl", name.replace('-', "_"), version),
        url: format!("https://files.example.invalid/{name}-{version}.whl")
            .parse()
            .unwrap(),
        hashes: None,
        requires_python: None,
        yanked: Default::default(),
    }
}

fn sdist_file(name: &str, version: &str) -> ArtifactInfo {
    ArtifactInfo {
        filename: format!("{name}-{version}.tar.gz"),
        url: format!("https://files.example.invalid/{name}-{version}.tar.gz")
            .parse()
            .unwrap(),
        hashes: None,
        requires_python: None,
        yanked: Default::default(),
    }
}

fn metadata_text(name: &str, version: &str, requires: &[&str]) -> Vec<u8> {
    let mut out = format!("Metadata-Version: 2.1\nName: {name}\nVersion: {version}\n");
    for requirement in requires {
        out.push_str(&format!("Requires-Dist: {requirement}\n"));
    }
    out.into_bytes()
}

/// A canned registry. Unless overridden, wheel METADATA is generated from the same
/// requirement lists the index serves, so enabling wheel validation does not change
/// anything by itself.
#[derive(Default)]
struct StaticRegistry {
    /// name -> [(version, files)]
    releases: HashMap<String, Vec<(String, Vec<ArtifactInfo>)>>,
    /// (name, version) -> (display name, requires_dist)
    metadata: HashMap<(String, String), (String, Vec<String>)>,
    /// filename -> raw METADATA, overriding the generated one
    wheel_metadata: HashMap<String, Vec<u8>>,
    wheel_reads: AtomicUsize,
}

impl StaticRegistry {
    /// Register a package version: its files and its index-side requirements.
    fn package(
        mut self,
        name: &str,
        version: &str,
        files: Vec<ArtifactInfo>,
        requires: &[&str],
    ) -> Self {
        self.releases
            .entry(name.to_string())
            .or_default()
            .push((version.to_string(), files));
        self.metadata.insert(
            (name.to_string(), version.to_string()),
            (
                name.to_string(),
                requires.iter().map(|s| s.to_string()).collect(),
            ),
        );
        self
    }

    /// Serve different METADATA from the wheel of `name version` than from the index.
    fn wheel_metadata_override(mut self, name: &str, version: &str, requires: &[&str]) -> Self {
        let filename = wheel_file(name, version).filename;
        self.wheel_metadata
            .insert(filename, metadata_text(name, version, requires));
        self
    }

    fn wheel_reads(&self) -> usize {
        self.wheel_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryClient for StaticRegistry {
    async fn get_releases(
        &self,
        name: &NormalizedPackageName,
    ) -> Result<ReleaseMap, RegistryError> {
        let Some(versions) = self.releases.get(name.as_str()) else {
            return Err(RegistryError::NotFound(name.clone()));
        };
        let mut releases = ReleaseMap::default();
        for (version, files) in versions {
            releases.insert(Version::from_str(version).unwrap(), files.clone());
        }
        releases.sort_unstable_by(|v1, _, v2, _| v2.cmp(v1));
        Ok(releases)
    }

    async fn get_metadata(
        &self,
        name: &NormalizedPackageName,
        version: &Version,
    ) -> Result<VersionMetadata, RegistryError> {
        let (display_name, requires_dist) = self
            .metadata
            .get(&(name.as_str().to_string(), version.to_string()))
            .unwrap_or_else(|| panic!("no metadata fixture for {name} {version}"));
        Ok(VersionMetadata {
            name: display_name.clone(),
            requires_dist: Some(requires_dist.clone()),
        })
    }

    async fn get_wheel_metadata(
        &self,
        name: &NormalizedPackageName,
        version: &Version,
        file: &ArtifactInfo,
    ) -> Result<CoreMetadata, RegistryError> {
        self.wheel_reads.fetch_add(1, Ordering::SeqCst);
        let blob = match self.wheel_metadata.get(&file.filename) {
            Some(blob) => blob.clone(),
            None => {
                let (display_name, requires_dist) = self
                    .metadata
                    .get(&(name.as_str().to_string(), version.to_string()))
                    .ok_or_else(|| {
                        RegistryError::WheelMetadata(
                            file.filename.clone(),
                            WheelMetadataError::MetadataMissing,
                        )
                    })?;
                let requires: Vec<&str> = requires_dist.iter().map(String::as_str).collect();
                metadata_text(display_name, &version.to_string(), &requires)
            }
        };
        CoreMetadata::try_from(blob.as_slice())
            .map_err(|err| RegistryError::WheelMetadata(file.filename.clone(), err.into()))
    }
}

/// A build driver that serves canned METADATA instead of running a build backend.
#[derive(Default)]
struct StaticBuilder {
    /// filename -> raw METADATA
    metadata: HashMap<String, Vec<u8>>,
    builds: AtomicUsize,
}

impl StaticBuilder {
    fn sdist(mut self, name: &str, version: &str, requires: &[&str]) -> Self {
        let filename = sdist_file(name, version).filename;
        self.metadata
            .insert(filename, metadata_text(name, version, requires));
        self
    }

    fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SdistBuilder for StaticBuilder {
    async fn build_sdist(&self, file: &ArtifactInfo) -> Result<CoreMetadata, SdistBuildError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let blob = self
            .metadata
            .get(&file.filename)
            .unwrap_or_else(|| panic!("no sdist fixture for {}", file.filename));
        CoreMetadata::try_from(blob.as_slice())
            .map_err(|err| SdistBuildError::InvalidMetadata(file.filename.clone(), err))
    }
}

fn no_wheels() -> ResolveOptions {
    ResolveOptions {
        download_wheels: false,
        ..Default::default()
    }
}

/// A registry shaped like the pandas dependency graph: a few transitive levels, no
/// sdists, several versions per package.
fn pandas_like_registry() -> StaticRegistry {
    StaticRegistry::default()
        .package(
            "pandas",
            "1.5.2",
            vec![wheel_file("pandas", "1.5.2")],
            &[
                "python-dateutil (>=2.8.1)",
                "pytz (>=2020.1)",
                "numpy (>=1.21.0)",
            ],
        )
        .package(
            "pandas",
            "1.5.1",
            vec![wheel_file("pandas", "1.5.1")],
            &["python-dateutil (>=2.8.1)", "pytz (>=2020.1)"],
        )
        .package(
            "python-dateutil",
            "2.8.2",
            vec![wheel_file("python-dateutil", "2.8.2")],
            &["six (>=1.5)"],
        )
        .package("pytz", "2022.7", vec![wheel_file("pytz", "2022.7")], &[])
        .package("pytz", "2022.1", vec![wheel_file("pytz", "2022.1")], &[])
        .package("numpy", "1.24.1", vec![wheel_file("numpy", "1.24.1")], &[])
        .package("numpy", "1.24.0", vec![wheel_file("numpy", "1.24.0")], &[])
        .package("six", "1.16.0", vec![wheel_file("six", "1.16.0")], &[])
}

#[tokio::test]
async fn test_transitive_resolution() {
    let registry = pandas_like_registry();
    let builder = StaticBuilder::default();

    let resolution = resolve_requirement(
        requirement("pandas"),
        &requires_python(">=3.8"),
        &registry,
        &builder,
        &no_wheels(),
    )
    .await
    .unwrap();

    assert_eq!(
        resolution.to_frozen(),
        "numpy==1.24.1\npandas==1.5.2\npython-dateutil==2.8.2\npytz==2022.7\nsix==1.16.0\n"
    );
    assert_eq!(builder.builds(), 0);
    assert_eq!(registry.wheel_reads(), 0);
}

#[tokio::test]
async fn test_unique_versions_and_constraint_satisfaction() {
    let registry = pandas_like_registry();
    let builder = StaticBuilder::default();

    // An extra root constraining numpy below pandas' default pick
    let resolution = resolve_requirements(
        vec![requirement("pandas"), requirement("numpy <1.24.1")],
        &requires_python(">=3.8"),
        &registry,
        &builder,
        &no_wheels(),
    )
    .await
    .unwrap();

    // Each package appears exactly once, and the numpy constraint is honored
    let names: Vec<&str> = resolution
        .packages
        .keys()
        .map(|(name, _)| name.as_str())
        .collect();
    let mut deduped = names.clone();
    deduped.dedup();
    assert_eq!(names, deduped);
    assert!(resolution.to_frozen().contains("numpy==1.24.0"));
}

#[tokio::test]
async fn test_conflicting_roots() {
    let registry = StaticRegistry::default()
        .package("foo", "1.0", vec![wheel_file("foo", "1.0")], &[])
        .package("foo", "2.0", vec![wheel_file("foo", "2.0")], &[]);
    let builder = StaticBuilder::default();

    let err = resolve_requirements(
        vec![requirement("foo ==1.0"), requirement("foo ==2.0")],
        &requires_python(">=3.8"),
        &registry,
        &builder,
        &no_wheels(),
    )
    .await
    .unwrap_err();

    let ResolveError::NoCompatibleVersion {
        name,
        constraints,
        versions,
    } = &err
    else {
        panic!("expected NoCompatibleVersion, got {err:?}");
    };
    assert_eq!(name.as_str(), "foo");
    assert_eq!(constraints.len(), 2);
    assert_eq!(
        versions,
        &["1.0".parse::<Version>().unwrap(), "2.0".parse().unwrap()]
    );
    // The rendered message lists both constraints and the inspected versions
    let message = err.to_string();
    assert!(message.contains("==1.0"), "{message}");
    assert!(message.contains("==2.0"), "{message}");
    assert!(message.contains("1.0, 2.0"), "{message}");
}

#[tokio::test]
async fn test_wheel_metadata_rescues_empty_requires_dist() {
    // The index claims gunicorn has no requirements at all; only its wheel METADATA
    // names the real ones.
    let registry = StaticRegistry::default()
        .package(
            "app",
            "1.0",
            vec![wheel_file("app", "1.0")],
            &["gunicorn (>=20)"],
        )
        .package(
            "gunicorn",
            "20.1.0",
            vec![wheel_file("gunicorn", "20.1.0")],
            &[],
        )
        .package(
            "packaging",
            "23.0",
            vec![wheel_file("packaging", "23.0")],
            &[],
        )
        .wheel_metadata_override("gunicorn", "20.1.0", &["packaging"]);
    let builder = StaticBuilder::default();

    // Without wheel validation the packaging requirement is invisible
    let resolution = resolve_requirement(
        requirement("app"),
        &requires_python(">=3.8"),
        &registry,
        &builder,
        &no_wheels(),
    )
    .await
    .unwrap();
    assert_eq!(resolution.to_frozen(), "app==1.0\ngunicorn==20.1.0\n");

    // With wheel validation the authoritative metadata wins
    let resolution = resolve_requirement(
        requirement("app"),
        &requires_python(">=3.8"),
        &registry,
        &builder,
        &ResolveOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(
        resolution.to_frozen(),
        "app==1.0\ngunicorn==20.1.0\npackaging==23.0\n"
    );
    assert!(registry.wheel_reads() > 0);
}

#[tokio::test]
async fn test_wheel_metadata_forces_reselection() {
    // The wheel METADATA carries a tighter constraint than the index, which must
    // displace an already chosen candidate.
    let registry = StaticRegistry::default()
        .package("app", "1.0", vec![wheel_file("app", "1.0")], &["dep"])
        .package("dep", "2.0", vec![wheel_file("dep", "2.0")], &[])
        .package("dep", "1.5", vec![wheel_file("dep", "1.5")], &[])
        .wheel_metadata_override("app", "1.0", &["dep (<2)"]);
    let builder = StaticBuilder::default();

    let resolution = resolve_requirement(
        requirement("app"),
        &requires_python(">=3.8"),
        &registry,
        &builder,
        &ResolveOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(resolution.to_frozen(), "app==1.0\ndep==1.5\n");
}

#[tokio::test]
async fn test_sdist_build() {
    // srcpkg only publishes an sdist, and the index knows nothing about its
    // requirements; the build driver has the authoritative answer.
    let registry = StaticRegistry::default()
        .package("app", "1.0", vec![wheel_file("app", "1.0")], &["srcpkg"])
        .package("srcpkg", "2.0", vec![sdist_file("srcpkg", "2.0")], &[])
        .package("six", "1.16.0", vec![wheel_file("six", "1.16.0")], &[]);
    let builder = StaticBuilder::default().sdist("srcpkg", "2.0", &["six (>=1.5)"]);

    let resolution = resolve_requirement(
        requirement("app"),
        &requires_python(">=3.8"),
        &registry,
        &builder,
        &no_wheels(),
    )
    .await
    .unwrap();

    assert_eq!(
        resolution.to_frozen(),
        "app==1.0\nsix==1.16.0\nsrcpkg==2.0\n"
    );
    assert_eq!(builder.builds(), 1);
}

#[tokio::test]
async fn test_ambiguous_sdist() {
    let registry = StaticRegistry::default().package(
        "srcpkg",
        "2.0",
        vec![
            sdist_file("srcpkg", "2.0"),
            ArtifactInfo {
                filename: "srcpkg-2.0.zip".to_string(),
                url: "https://files.example.invalid/srcpkg-2.0.zip".parse().unwrap(),
                hashes: None,
                requires_python: None,
                yanked: Default::default(),
            },
        ],
        &[],
    );
    let builder = StaticBuilder::default();

    let err = resolve_requirement(
        requirement("srcpkg"),
        &requires_python(">=3.8"),
        &registry,
        &builder,
        &no_wheels(),
    )
    .await
    .unwrap_err();

    let ResolveError::AmbiguousSdist { name, files, .. } = &err else {
        panic!("expected AmbiguousSdist, got {err:?}");
    };
    assert_eq!(name.as_str(), "srcpkg");
    assert_eq!(files.len(), 2);
}

#[tokio::test]
async fn test_prerelease_gating() {
    let registry = StaticRegistry::default()
        .package("mixed", "1.0", vec![wheel_file("mixed", "1.0")], &[])
        .package("mixed", "1.1a1", vec![wheel_file("mixed", "1.1a1")], &[])
        .package(
            "pre-only",
            "0.2b1",
            vec![wheel_file("pre-only", "0.2b1")],
            &[],
        );
    let builder = StaticBuilder::default();

    // Plain requirement: the prerelease is skipped
    let resolution = resolve_requirement(
        requirement("mixed"),
        &requires_python(">=3.8"),
        &registry,
        &builder,
        &no_wheels(),
    )
    .await
    .unwrap();
    assert_eq!(resolution.to_frozen(), "mixed==1.0\n");

    // A prerelease-bearing clause opts exactly that release in
    let resolution = resolve_requirement(
        requirement("mixed >=1.1a1"),
        &requires_python(">=3.8"),
        &registry,
        &builder,
        &no_wheels(),
    )
    .await
    .unwrap();
    assert_eq!(resolution.to_frozen(), "mixed==1.1a1\n");

    // A package that only ever published prereleases is still resolvable
    let resolution = resolve_requirement(
        requirement("pre-only"),
        &requires_python(">=3.8"),
        &registry,
        &builder,
        &no_wheels(),
    )
    .await
    .unwrap();
    assert_eq!(resolution.to_frozen(), "pre-only==0.2b1\n");
}

#[tokio::test]
async fn test_invalid_requires_dist_removes_version() {
    // Version 2.0 has unparseable requirements even after the fixup, so the resolver
    // falls back to 1.9.
    let registry = StaticRegistry::default()
        .package("broken", "2.0", vec![wheel_file("broken", "2.0")], &["(((("])
        .package("broken", "1.9", vec![wheel_file("broken", "1.9")], &[]);
    let builder = StaticBuilder::default();

    let resolution = resolve_requirement(
        requirement("broken"),
        &requires_python(">=3.8"),
        &registry,
        &builder,
        &no_wheels(),
    )
    .await
    .unwrap();
    assert_eq!(resolution.to_frozen(), "broken==1.9\n");
}

#[tokio::test]
async fn test_determinism() {
    let registry = pandas_like_registry();
    let builder = StaticBuilder::default();

    let mut frozen = Vec::new();
    let mut key_orders = Vec::new();
    for _ in 0..2 {
        let resolution = resolve_requirement(
            requirement("pandas"),
            &requires_python(">=3.8"),
            &registry,
            &builder,
            &no_wheels(),
        )
        .await
        .unwrap();
        frozen.push(resolution.to_frozen());
        key_orders.push(resolution.packages.keys().cloned().collect::<Vec<_>>());
    }
    assert_eq!(frozen[0], frozen[1]);
    assert_eq!(key_orders[0], key_orders[1]);
}

fn linux_env() -> MarkerEnvironment {
    serde_json::from_str(
        r#"{
            "implementation_name": "cpython",
            "implementation_version": "3.10.9",
            "os_name": "posix",
            "platform_machine": "x86_64",
            "platform_python_implementation": "CPython",
            "platform_release": "",
            "platform_system": "Linux",
            "platform_version": "",
            "python_full_version": "3.10.9",
            "python_version": "3.10",
            "sys_platform": "linux"
        }"#,
    )
    .unwrap()
}

fn windows_env() -> MarkerEnvironment {
    serde_json::from_str(
        r#"{
            "implementation_name": "cpython",
            "implementation_version": "3.10.9",
            "os_name": "nt",
            "platform_machine": "AMD64",
            "platform_python_implementation": "CPython",
            "platform_release": "",
            "platform_system": "Windows",
            "platform_version": "",
            "python_full_version": "3.10.9",
            "python_version": "3.10",
            "sys_platform": "win32"
        }"#,
    )
    .unwrap()
}

fn marker_registry() -> StaticRegistry {
    StaticRegistry::default()
        .package(
            "app",
            "1.0",
            vec![wheel_file("app", "1.0")],
            &[
                "base",
                "winlib ; platform_system == \"Windows\"",
                "guilib ; extra == \"gui\"",
            ],
        )
        .package("base", "1.0", vec![wheel_file("base", "1.0")], &[])
        .package("winlib", "1.0", vec![wheel_file("winlib", "1.0")], &[])
        .package("guilib", "1.0", vec![wheel_file("guilib", "1.0")], &[])
}

async fn resolve_marker_app(root: &str) -> Resolution {
    let registry = marker_registry();
    let builder = StaticBuilder::default();
    resolve_requirement(
        requirement(root),
        &requires_python(">=3.8"),
        &registry,
        &builder,
        &no_wheels(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_environment_projection() {
    let resolution = resolve_marker_app("app[gui]").await;

    // The resolution covers every environment the requires_python range admits
    assert_eq!(
        resolution.to_frozen(),
        "app==1.0\nbase==1.0\nguilib==1.0\nwinlib==1.0\n"
    );

    // Projection drops the edges whose markers are false under the target env
    let linux = resolution.for_environment(&linux_env(), &[]);
    assert_eq!(linux.to_frozen(), "app==1.0\nbase==1.0\nguilib==1.0\n");

    let windows = resolution.for_environment(&windows_env(), &[]);
    assert_eq!(
        windows.to_frozen(),
        "app==1.0\nbase==1.0\nguilib==1.0\nwinlib==1.0\n"
    );

    // Without the extra in the root requirement, the extra-gated edge is dead
    // already during resolution; the platform-gated one stays because the
    // resolution has to cover every environment
    let without_extra = resolve_marker_app("app").await;
    assert_eq!(
        without_extra.to_frozen(),
        "app==1.0\nbase==1.0\nwinlib==1.0\n"
    );
}

#[tokio::test]
async fn test_projection_idempotence() {
    let resolution = resolve_marker_app("app[gui]").await;
    let once = resolution.for_environment(&linux_env(), &[]);
    let twice = once.for_environment(&linux_env(), &[]);
    assert_eq!(once.to_frozen(), twice.to_frozen());
    assert_eq!(
        once.packages.keys().collect::<Vec<_>>(),
        twice.packages.keys().collect::<Vec<_>>()
    );
}
