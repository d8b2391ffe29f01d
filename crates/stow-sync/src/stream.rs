//! Upload descriptors

use std::fmt;
use std::path::Path;

use stow_core::policy::clean_path;
use stow_storage::Payload;
use tokio::io::AsyncRead;

/// Whether an upload moves bytes or only registers metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Content is streamed to the storage handler
    Transfer,
    /// Content already sits at its final location; only metadata is recorded
    RegisterOnly,
}

/// One upload, scoped to a single `FileSystem::upload` call.
pub struct FileStream {
    pub size: u64,
    pub name: String,
    /// Virtual folder, always forward-slash and rooted at `/`
    pub virtual_path: String,
    pub mime_type: String,
    /// Physical location of register-only content
    pub save_path: Option<String>,
    mode: StreamMode,
    content: Option<Payload>,
}

impl FileStream {
    /// An upload whose bytes are read from `content`.
    pub fn transfer(
        name: impl Into<String>,
        virtual_path: &str,
        size: u64,
        content: impl AsyncRead + Send + Sync + Unpin + 'static,
    ) -> Self {
        Self {
            size,
            name: name.into(),
            virtual_path: normalize_virtual_path(virtual_path),
            mime_type: String::new(),
            save_path: None,
            mode: StreamMode::Transfer,
            content: Some(Box::new(content)),
        }
    }

    /// A metadata-only upload for a file already stored at `save_path`.
    pub fn register_only(
        name: impl Into<String>,
        virtual_path: &str,
        size: u64,
        save_path: impl Into<String>,
    ) -> Self {
        Self {
            size,
            name: name.into(),
            virtual_path: normalize_virtual_path(virtual_path),
            mime_type: String::new(),
            save_path: Some(save_path.into()),
            mode: StreamMode::RegisterOnly,
            content: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Move the content out; `None` for register-only streams or once taken.
    pub(crate) fn take_content(&mut self) -> Option<Payload> {
        self.content.take()
    }
}

impl fmt::Debug for FileStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStream")
            .field("size", &self.size)
            .field("name", &self.name)
            .field("virtual_path", &self.virtual_path)
            .field("mime_type", &self.mime_type)
            .field("save_path", &self.save_path)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Forward-slash, rooted form of a virtual path.
pub fn normalize_virtual_path(path: &str) -> String {
    let slashed = separators_to_slash(path, '\\');
    clean_path(&format!("/{slashed}"))
}

/// Host path in forward-slash form.
pub fn to_slash(path: &Path) -> String {
    separators_to_slash(&path.to_string_lossy(), std::path::MAIN_SEPARATOR)
}

/// Replace `separator` with `/`.
pub fn separators_to_slash(path: &str, separator: char) -> String {
    if separator == '/' {
        path.to_string()
    } else {
        path.replace(separator, "/")
    }
}
