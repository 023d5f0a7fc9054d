//! File-type dispatch for plugin loading.
//!
//! The registry does not know how any particular file becomes a plugin; it
//! asks each registered [`PluginLoader`] whether it claims a path and, if so,
//! hands the file over.

use std::path::Path;

use toolweave_core::error::PluginError;
use toolweave_core::tool::Plugin;

/// Turns a file on disk into a [`Plugin`].
///
/// `load` runs on the blocking pool, so implementations may do synchronous
/// file I/O or compilation freely.
pub trait PluginLoader: Send + Sync {
    /// The plugin name for `path`, or `None` if this loader does not handle it.
    fn plugin_name(&self, path: &Path) -> Option<String>;

    fn load(&self, name: &str, path: &Path) -> Result<Box<dyn Plugin>, PluginError>;
}

/// Strip a compound suffix such as `.plugin.json` from a file name.
pub(crate) fn stem_with_suffix(path: &Path, suffix: &str) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    let stem = file_name.strip_suffix(suffix)?;
    (!stem.is_empty()).then(|| stem.to_string())
}

/// Files whose name starts with `_` are private helpers, never plugins.
pub(crate) fn is_private(name: &str) -> bool {
    name.starts_with('_')
}
