/// Application name, used for lock files and profile outputs.
pub const APP_NAME: &str = "strata";

/// Directory inside every image holding build metadata.
pub const META_DIR: &str = ".meta";

/// Serialized flavor config of a built layer, relative to the image root.
pub const META_FLAVOR_FILE: &str = ".meta/flavor.json";

/// Marker written when built artifacts may need the source repo at runtime.
pub const META_ARTIFACTS_REQUIRE_REPO: &str = ".meta/private/opts/artifacts_may_require_repo";

/// Directory of recorded host mounts, relative to the image root.
pub const META_MOUNTS_DIR: &str = ".meta/mounts";

/// Hostname given to the build appliance container.
pub const BUILD_APPLIANCE_HOSTNAME: &str = "strata-build-appliance";

/// Version of the `SubvolumeOnDisk` document.
pub const DESCRIPTOR_VERSION: u32 = 1;

/// Environment variable providing a default `--profile` directory.
pub const PROFILE_ENV: &str = "STRATA_PROFILE";
