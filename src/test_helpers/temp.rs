use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use zip::write::FileOptions;
use zip::ZipWriter;

/// Test context with temporary directory management.
/// Automatically cleans up when dropped.
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a new test context with a fresh temporary directory
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    /// Get the root path of the temporary directory
    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Create a file with content at the given relative path
    pub fn create_file(&self, relative_path: &str, content: &str) -> PathBuf {
        let path = self.root().join(relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dirs");
        }
        fs::write(&path, content).expect("Failed to write file");
        path
    }

    /// Write a DFU package: an optional manifest.json plus the given entries.
    pub fn create_package(
        &self,
        relative_path: &str,
        manifest: Option<&str>,
        files: &[(&str, &[u8])],
    ) -> PathBuf {
        let path = self.root().join(relative_path);
        let file = fs::File::create(&path).expect("Failed to create package");
        let mut zip = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);

        if let Some(manifest) = manifest {
            zip.start_file("manifest.json", options)
                .expect("Failed to add manifest");
            zip.write_all(manifest.as_bytes())
                .expect("Failed to write manifest");
        }

        for (name, content) in files {
            zip.start_file(*name, options).expect("Failed to add entry");
            zip.write_all(content).expect("Failed to write entry");
        }

        zip.finish().expect("Failed to finish package");
        path
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
