use tracing::{debug, info};

use crate::config::ProbeConfig;
use crate::export::{ExportedFunction, FuzzError, ProbeSummary};
use crate::extractor::walk_exports;
use crate::image::ExecutableImage;

/// One probing session over a single mapped image.
///
/// Owns the image handle and the cached export list. Only one sweep runs at a
/// time across the whole process.
#[derive(Debug)]
pub struct ExportFuzzer {
    image: ExecutableImage,
    exports: Vec<ExportedFunction>,
    config: ProbeConfig,
}

impl ExportFuzzer {
    /// Resolve `image_name` through the OS loader and enumerate its exports
    pub fn open(image_name: &str) -> Result<Self, FuzzError> {
        Self::open_with_config(image_name, ProbeConfig::default())
    }

    pub fn open_with_config(image_name: &str, config: ProbeConfig) -> Result<Self, FuzzError> {
        let base = load_image(image_name)?;
        info!(image = image_name, base = %format!("{:p}", base), "image mapped");
        unsafe { Self::from_mapped(image_name, base, config) }
    }

    /// Start a session over an image that is already mapped at `base`.
    ///
    /// # Safety
    /// The image must stay mapped and readable for the life of the session.
    pub unsafe fn from_mapped(
        image_name: &str,
        base: *const u8,
        config: ProbeConfig,
    ) -> Result<Self, FuzzError> {
        let mut fuzzer = Self {
            image: ExecutableImage::new(image_name, base),
            exports: Vec::new(),
            config,
        };
        fuzzer.image.view()?;
        fuzzer.refresh_exports()?;
        Ok(fuzzer)
    }

    pub fn image_name(&self) -> &str {
        self.image.name()
    }

    /// Base address of the image, re-validated on every call
    pub fn image_base(&self) -> Result<usize, FuzzError> {
        self.image.validated_base()
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// The cached export list, rebuilt first if it is empty
    pub fn list_exports(&mut self) -> Result<&[ExportedFunction], FuzzError> {
        if self.exports.is_empty() {
            return self.refresh_exports();
        }
        Ok(&self.exports)
    }

    /// Discard the export list and walk the export table again
    pub fn refresh_exports(&mut self) -> Result<&[ExportedFunction], FuzzError> {
        self.exports.clear();
        let view = self.image.view()?;
        self.exports = walk_exports(&view)?;
        debug!(image = self.image.name(), exports = self.exports.len(), "export list rebuilt");
        Ok(&self.exports)
    }

    /// Probe every export in export-list order
    pub fn probe_all(&mut self) -> Result<ProbeSummary, FuzzError> {
        self.probe_matching(|_| true)
    }

    /// Probe the exports accepted by `filter`; the rest keep their records.
    ///
    /// The crash recovery handler is installed for exactly the duration of
    /// the sweep and removed on every exit path.
    pub fn probe_matching<F>(&mut self, filter: F) -> Result<ProbeSummary, FuzzError>
    where
        F: FnMut(&ExportedFunction) -> bool,
    {
        self.list_exports()?;
        self.sweep(filter)
    }

    /// Look up one export by name
    pub fn export(&self, name: &str) -> Option<&ExportedFunction> {
        self.exports.iter().find(|f| f.name == name)
    }

    #[cfg(all(windows, any(target_arch = "x86", target_arch = "x86_64")))]
    fn sweep<F>(&mut self, mut filter: F) -> Result<ProbeSummary, FuzzError>
    where
        F: FnMut(&ExportedFunction) -> bool,
    {
        self.image.view()?;
        let selected = self.exports.iter_mut().filter(|f| filter(f));
        crate::prober::sweep(selected, &self.config)
    }

    #[cfg(not(all(windows, any(target_arch = "x86", target_arch = "x86_64"))))]
    fn sweep<F>(&mut self, _filter: F) -> Result<ProbeSummary, FuzzError>
    where
        F: FnMut(&ExportedFunction) -> bool,
    {
        Err(FuzzError::UnsupportedPlatform("probing requires Windows on x86 or x86_64"))
    }
}

/// Return the base of an already-mapped module, or map it.
#[cfg(windows)]
fn load_image(image_name: &str) -> Result<*const u8, FuzzError> {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::libloaderapi::{GetModuleHandleW, LoadLibraryW};

    if image_name.is_empty() {
        return Err(FuzzError::LoadFailure {
            name: String::new(),
            code: 0,
        });
    }

    let wide: Vec<u16> = OsStr::new(image_name).encode_wide().chain(Some(0)).collect();
    let module = unsafe {
        let loaded = GetModuleHandleW(wide.as_ptr());
        if loaded.is_null() {
            LoadLibraryW(wide.as_ptr())
        } else {
            loaded
        }
    };
    if module.is_null() {
        return Err(FuzzError::LoadFailure {
            name: image_name.to_string(),
            code: unsafe { GetLastError() },
        });
    }
    Ok(module as *const u8)
}

#[cfg(not(windows))]
fn load_image(image_name: &str) -> Result<*const u8, FuzzError> {
    debug!(image = image_name, "no PE loader on this platform");
    Err(FuzzError::UnsupportedPlatform("loading PE images requires Windows"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::ImageBuilder;

    fn session(image: &[u8]) -> ExportFuzzer {
        unsafe { ExportFuzzer::from_mapped("fixture.dll", image.as_ptr(), ProbeConfig::default()) }
            .unwrap()
    }

    #[test]
    fn open_enumerates_eagerly() {
        let image = ImageBuilder::new().export("Gamma").export("Beta").build();
        let mut fuzzer = session(&image);

        assert_eq!(fuzzer.image_base().unwrap(), image.as_ptr() as usize);
        let names: Vec<_> = fuzzer.list_exports().unwrap().iter().map(|f| f.name.clone()).collect();
        assert_eq!(names, vec!["Gamma", "Beta"]);
        assert!(fuzzer.export("Beta").is_some());
        assert!(fuzzer.export("Delta").is_none());
    }

    #[test]
    fn listing_twice_is_identical() {
        let image = ImageBuilder::pe32().export("One").export("Two").build();
        let mut fuzzer = session(&image);

        let first = fuzzer.list_exports().unwrap().to_vec();
        let second = fuzzer.list_exports().unwrap().to_vec();
        assert_eq!(first, second);
        assert_eq!(fuzzer.refresh_exports().unwrap(), first.as_slice());
    }

    #[test]
    fn zero_export_image_lists_nothing() {
        let image = ImageBuilder::new().without_export_directory().build();
        let mut fuzzer = session(&image);
        assert!(fuzzer.list_exports().unwrap().is_empty());
        assert!(fuzzer.list_exports().unwrap().is_empty());
    }

    #[test]
    fn invalid_image_is_rejected_at_open() {
        let mut image = ImageBuilder::new().export("A").build();
        image[0] = 0;
        let result =
            unsafe { ExportFuzzer::from_mapped("broken.dll", image.as_ptr(), ProbeConfig::default()) };
        assert!(matches!(result, Err(FuzzError::InvalidImage(_))));
    }

    #[test]
    fn nonexistent_image_fails_to_load() {
        let result = ExportFuzzer::open("argprobe-no-such-image-4f1c.dll");
        if cfg!(windows) {
            assert!(matches!(result, Err(FuzzError::LoadFailure { .. })));
        } else {
            assert!(matches!(result, Err(FuzzError::UnsupportedPlatform(_))));
        }
    }

    #[cfg(not(windows))]
    #[test]
    fn probing_needs_windows() {
        let image = ImageBuilder::new().export("A").build();
        let mut fuzzer = session(&image);
        assert!(matches!(fuzzer.probe_all(), Err(FuzzError::UnsupportedPlatform(_))));
    }

    #[cfg(all(windows, any(target_arch = "x86", target_arch = "x86_64")))]
    #[test]
    fn probe_all_marks_forwarders_and_removes_handler() {
        let image = ImageBuilder::new()
            .forwarded("HeapAlloc", "NTDLL.RtlAllocateHeap")
            .forwarded("HeapFree", "NTDLL.RtlFreeHeap")
            .build();
        let mut fuzzer = session(&image);

        let summary = fuzzer.probe_all().unwrap();

        assert_eq!(summary.skipped, 2);
        assert!(fuzzer.list_exports().unwrap().iter().all(|f| f.arg_count.is_none()));
        let _sweep = crate::recovery::lock_sweeps();
        assert!(!crate::recovery::is_installed());
    }
}
