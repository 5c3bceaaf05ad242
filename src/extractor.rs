use crate::config::MAX_EXPORT_NAME_LEN;
use crate::export::{ExportedFunction, FuzzError};
use crate::image::{ImageView, DIRECTORY_ENTRY_EXPORT};
use tracing::{debug, warn};

const EXPORT_DIRECTORY_LEN: usize = 40;

/// Fields of the export directory needed to walk its three tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportDirectory {
    pub rva: u32,
    pub size: u32,
    pub ordinal_base: u32,
    pub number_of_functions: u32,
    pub number_of_names: u32,
    pub functions_rva: u32,
    pub names_rva: u32,
    pub ordinals_rva: u32,
}

impl ExportDirectory {
    /// Function RVAs inside the directory point at forwarder strings, not code
    fn is_forwarder(&self, function_rva: u32) -> bool {
        function_rva >= self.rva && function_rva - self.rva < self.size
    }
}

/// Locate and bounds-check the export directory.
///
/// The name and ordinal tables must fit in the image. Address table entries
/// are checked one at a time by `resolve_export`, since `NumberOfFunctions`
/// may overstate the table. Returns `Ok(None)` when the image exports nothing.
pub fn read_export_directory(image: &ImageView<'_>) -> Result<Option<ExportDirectory>, FuzzError> {
    let entry = match image.data_directory(DIRECTORY_ENTRY_EXPORT) {
        Some(entry) if entry.rva != 0 && entry.size != 0 => entry,
        _ => return Ok(None),
    };
    if !image.contains(entry.rva, EXPORT_DIRECTORY_LEN) {
        return Err(FuzzError::InvalidImage("export directory outside image"));
    }

    let field = |offset: u32| {
        image
            .read_u32(entry.rva + offset)
            .ok_or(FuzzError::InvalidImage("truncated export directory"))
    };
    let directory = ExportDirectory {
        rva: entry.rva,
        size: entry.size,
        ordinal_base: field(16)?,
        number_of_functions: field(20)?,
        number_of_names: field(24)?,
        functions_rva: field(28)?,
        names_rva: field(32)?,
        ordinals_rva: field(36)?,
    };

    if directory.number_of_names == 0 {
        return Ok(Some(directory));
    }
    let names = directory.number_of_names as usize;
    if !image.contains(directory.names_rva, names.saturating_mul(4)) {
        return Err(FuzzError::InvalidImage("export name table outside image"));
    }
    if !image.contains(directory.ordinals_rva, names.saturating_mul(2)) {
        return Err(FuzzError::InvalidImage("export ordinal table outside image"));
    }

    Ok(Some(directory))
}

/// Walk the export tables and return every export that has a name.
///
/// Entries are returned in name-table order. A malformed entry is logged and
/// skipped; it never aborts the walk.
pub fn walk_exports(image: &ImageView<'_>) -> Result<Vec<ExportedFunction>, FuzzError> {
    let directory = match read_export_directory(image)? {
        Some(directory) => directory,
        None => {
            debug!("image has no export directory");
            return Ok(Vec::new());
        }
    };

    let mut functions = Vec::with_capacity(directory.number_of_names as usize);
    for index in 0..directory.number_of_names {
        match resolve_export(image, &directory, index) {
            Ok(function) => functions.push(function),
            Err(e) => warn!(error = %e, "skipping export entry"),
        }
    }

    debug!(
        exports = functions.len(),
        names = directory.number_of_names,
        "walked export table"
    );
    Ok(functions)
}

/// Resolve name-table entry `index` through the ordinal and address tables
pub fn resolve_export(
    image: &ImageView<'_>,
    directory: &ExportDirectory,
    index: u32,
) -> Result<ExportedFunction, FuzzError> {
    let malformed = |reason: String| FuzzError::MalformedExport { index, reason };

    let name_rva = image
        .read_u32(directory.names_rva + index * 4)
        .ok_or_else(|| malformed("name table entry unreadable".into()))?;
    let name_bytes = image
        .read_cstr(name_rva, MAX_EXPORT_NAME_LEN)
        .ok_or_else(|| malformed(format!("name at 0x{:x} is unterminated or outside image", name_rva)))?;
    if name_bytes.is_empty() {
        return Err(malformed("empty name".into()));
    }
    let name = std::str::from_utf8(name_bytes)
        .map_err(|_| malformed(format!("name at 0x{:x} is not UTF-8", name_rva)))?
        .to_string();

    let ordinal = image
        .read_u16(directory.ordinals_rva + index * 2)
        .ok_or_else(|| malformed("ordinal table entry unreadable".into()))?;
    if u32::from(ordinal) >= directory.number_of_functions {
        return Err(malformed(format!(
            "{} has ordinal {} outside address table of {}",
            name, ordinal, directory.number_of_functions
        )));
    }

    let function_rva = directory
        .functions_rva
        .checked_add(u32::from(ordinal) * 4)
        .and_then(|entry| image.read_u32(entry))
        .ok_or_else(|| malformed(format!("{} has an unreadable address entry", name)))?;
    if function_rva == 0 || !image.contains(function_rva, 1) {
        return Err(malformed(format!("{} has invalid RVA 0x{:x}", name, function_rva)));
    }

    let forwarder = if directory.is_forwarder(function_rva) {
        image
            .read_cstr(function_rva, MAX_EXPORT_NAME_LEN)
            .map(|target| String::from_utf8_lossy(target).into_owned())
    } else {
        None
    };

    Ok(ExportedFunction {
        ordinal: directory.ordinal_base.wrapping_add(u32::from(ordinal)),
        rva: function_rva,
        forwarder,
        ..ExportedFunction::new(name, image.address_of(function_rva))
    })
}

/// Names of every well-formed export, in name-table order
pub fn get_all_export_names(image: &ImageView<'_>) -> Result<Vec<String>, FuzzError> {
    Ok(walk_exports(image)?.into_iter().map(|f| f.name).collect())
}
