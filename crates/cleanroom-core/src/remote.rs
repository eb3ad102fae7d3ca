//! Fixed paths used inside instances.

pub use cleanroom_inject::AGENT_PATH;

/// Bootstrap for a package installed by a start hook.
pub const PACKAGE_INSTALL: &str = "/root/init/pkg/install";
/// Bootstrap for an artifact uploaded by a start hook or as a deploy resource.
pub const UPLOAD_DUMP: &str = "/root/init/data/dump";
/// Bootstrap for an artifact downloaded by a stop hook.
pub const DOWNLOAD_LOAD: &str = "/root/post/data/load";
pub const PUSH_DUMP: &str = "/root/.push/dump";
pub const PULL_LOAD: &str = "/root/.pull/load";
pub const PROVISION: &str = "/root/init/provision";
pub const TESTLET: &str = "/root/test";
