use crate::export::FuzzError;

const DOS_SIGNATURE: u16 = 0x5A4D; // MZ
const NT_SIGNATURE: u32 = 0x0000_4550; // PE\0\0
const PE32_MAGIC: u16 = 0x10B;
const PE32_PLUS_MAGIC: u16 = 0x20B;

const DOS_HEADER_LEN: usize = 0x40;
const E_LFANEW_OFFSET: usize = 0x3C;
/// Headers of a mapped image live in its first page.
const MAX_E_LFANEW: usize = 0x1000 - NT_HEADERS64_LEN;
const NT_HEADERS64_LEN: usize = 0x108;

// NT headers: signature (4) + file header (20), optional header follows.
const FILE_HEADER_OFFSET: usize = 4;
const OPTIONAL_HEADER_OFFSET: usize = 24;
const NT_FIXED_LEN: usize = OPTIONAL_HEADER_OFFSET + 2;

const SIZE_OF_OPTIONAL_HEADER_OFFSET: usize = 16;
const SIZE_OF_IMAGE_OFFSET: usize = 56;

/// Index of the export table in the data directory array
pub const DIRECTORY_ENTRY_EXPORT: usize = 0;

/// Location of one data directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDirectory {
    pub rva: u32,
    pub size: u32,
}

/// A validated, bounds-checked view over a mapped image
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    bytes: &'a [u8],
    nt_offset: usize,
    pe32_plus: bool,
    machine: u16,
}

impl<'a> ImageView<'a> {
    /// Validate the headers of an image laid out in `bytes` as it is mapped
    pub fn parse(bytes: &'a [u8]) -> Result<Self, FuzzError> {
        if bytes.len() < DOS_HEADER_LEN {
            return Err(FuzzError::InvalidImage("image smaller than a DOS header"));
        }
        if read_u16(bytes, 0) != Some(DOS_SIGNATURE) {
            return Err(FuzzError::InvalidImage("missing MZ signature"));
        }

        let nt_offset = read_u32(bytes, E_LFANEW_OFFSET)
            .ok_or(FuzzError::InvalidImage("truncated DOS header"))? as usize;
        if nt_offset > MAX_E_LFANEW {
            return Err(FuzzError::InvalidImage("e_lfanew outside header page"));
        }
        if read_u32(bytes, nt_offset) != Some(NT_SIGNATURE) {
            return Err(FuzzError::InvalidImage("missing PE signature"));
        }

        let machine = read_u16(bytes, nt_offset + FILE_HEADER_OFFSET)
            .ok_or(FuzzError::InvalidImage("truncated file header"))?;
        let optional_len =
            read_u16(bytes, nt_offset + FILE_HEADER_OFFSET + SIZE_OF_OPTIONAL_HEADER_OFFSET)
                .ok_or(FuzzError::InvalidImage("truncated file header"))? as usize;

        let pe32_plus = match read_u16(bytes, nt_offset + OPTIONAL_HEADER_OFFSET) {
            Some(PE32_MAGIC) => false,
            Some(PE32_PLUS_MAGIC) => true,
            _ => return Err(FuzzError::InvalidImage("unknown optional header magic")),
        };

        let view = Self {
            bytes,
            nt_offset,
            pe32_plus,
            machine,
        };
        if optional_len < view.data_directory_offset() {
            return Err(FuzzError::InvalidImage("optional header too small"));
        }
        if nt_offset + OPTIONAL_HEADER_OFFSET + optional_len > bytes.len() {
            return Err(FuzzError::InvalidImage("optional header outside image"));
        }
        Ok(view)
    }

    /// Validate the image mapped at `base`.
    ///
    /// The header fields are read in place before any slice is formed, so a
    /// region that is not an image is rejected without trusting its size.
    ///
    /// # Safety
    /// - `base` must be null or point to at least one readable page.
    /// - If the headers validate, `SizeOfImage` bytes from `base` must stay
    ///   mapped and readable for `'a`.
    pub unsafe fn from_base(base: *const u8) -> Result<Self, FuzzError> {
        if base.is_null() {
            return Err(FuzzError::InvalidImage("null image base"));
        }
        if (base as *const u16).read_unaligned() != DOS_SIGNATURE {
            return Err(FuzzError::InvalidImage("missing MZ signature"));
        }
        let nt_offset = (base.add(E_LFANEW_OFFSET) as *const u32).read_unaligned() as usize;
        if nt_offset > MAX_E_LFANEW {
            return Err(FuzzError::InvalidImage("e_lfanew outside header page"));
        }
        if (base.add(nt_offset) as *const u32).read_unaligned() != NT_SIGNATURE {
            return Err(FuzzError::InvalidImage("missing PE signature"));
        }

        let size_of_image = (base.add(nt_offset + OPTIONAL_HEADER_OFFSET + SIZE_OF_IMAGE_OFFSET)
            as *const u32)
            .read_unaligned() as usize;
        if size_of_image < nt_offset + NT_FIXED_LEN {
            return Err(FuzzError::InvalidImage("SizeOfImage smaller than headers"));
        }

        Self::parse(std::slice::from_raw_parts(base, size_of_image))
    }

    pub fn base(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// COFF machine type from the file header
    pub fn machine(&self) -> u16 {
        self.machine
    }

    pub fn is_pe32_plus(&self) -> bool {
        self.pe32_plus
    }

    /// Absolute address of an RVA inside this image
    pub fn address_of(&self, rva: u32) -> usize {
        self.base() as usize + rva as usize
    }

    pub fn contains(&self, rva: u32, len: usize) -> bool {
        (rva as usize)
            .checked_add(len)
            .map_or(false, |end| end <= self.bytes.len())
    }

    pub fn read_u16(&self, rva: u32) -> Option<u16> {
        read_u16(self.bytes, rva as usize)
    }

    pub fn read_u32(&self, rva: u32) -> Option<u32> {
        read_u32(self.bytes, rva as usize)
    }

    /// Bytes of the NUL-terminated string at `rva`, at most `max_len` long
    pub fn read_cstr(&self, rva: u32, max_len: usize) -> Option<&'a [u8]> {
        let start = rva as usize;
        let tail = self.bytes.get(start..)?;
        let window = &tail[..tail.len().min(max_len + 1)];
        let end = window.iter().position(|&b| b == 0)?;
        Some(&window[..end])
    }

    /// Entry `index` of the data directory array, if the header declares it
    pub fn data_directory(&self, index: usize) -> Option<DataDirectory> {
        let optional = self.nt_offset + OPTIONAL_HEADER_OFFSET;
        let count_offset = if self.pe32_plus { 108 } else { 92 };
        let declared = read_u32(self.bytes, optional + count_offset)? as usize;
        if index >= declared {
            return None;
        }
        let entry = optional + self.data_directory_offset() + index * 8;
        Some(DataDirectory {
            rva: read_u32(self.bytes, entry)?,
            size: read_u32(self.bytes, entry + 4)?,
        })
    }

    fn data_directory_offset(&self) -> usize {
        if self.pe32_plus {
            112
        } else {
            96
        }
    }
}

/// Handle to an image mapped into this process
#[derive(Debug)]
pub struct ExecutableImage {
    name: String,
    base: usize,
}

impl ExecutableImage {
    /// Wrap a mapped image.
    ///
    /// # Safety
    /// The image at `base` must stay mapped for the lifetime of the handle.
    pub unsafe fn new(name: impl Into<String>, base: *const u8) -> Self {
        Self {
            name: name.into(),
            base: base as usize,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Re-validate the headers and return a view of the image.
    ///
    /// Validation runs on every call; the mapping is not assumed stable.
    pub fn view(&self) -> Result<ImageView<'_>, FuzzError> {
        unsafe { ImageView::from_base(self.base as *const u8) }
    }

    /// Base address of the image, once its headers validate
    pub fn validated_base(&self) -> Result<usize, FuzzError> {
        self.view().map(|view| view.base() as usize)
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let raw = bytes.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([raw[0], raw[1]]))
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw = bytes.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}
