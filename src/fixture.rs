//! Synthetic images and callees for tests.

const E_LFANEW: usize = 0x80;
const EXPORT_DIR_RVA: usize = 0x1000;
const PAGE: usize = 0x1000;

#[derive(Clone)]
enum Entry {
    Code,
    Null,
    Forward(String),
}

/// Builds an in-memory image laid out the way the loader maps it
#[derive(Clone)]
pub(crate) struct ImageBuilder {
    pe32_plus: bool,
    exports: Vec<(String, Entry)>,
    ordinal_overrides: Vec<(usize, u16)>,
    name_count: Option<u32>,
    function_count: Option<u32>,
    export_directory: bool,
}

impl ImageBuilder {
    pub(crate) fn new() -> Self {
        Self {
            pe32_plus: true,
            exports: Vec::new(),
            ordinal_overrides: Vec::new(),
            name_count: None,
            function_count: None,
            export_directory: true,
        }
    }

    pub(crate) fn pe32() -> Self {
        Self {
            pe32_plus: false,
            ..Self::new()
        }
    }

    pub(crate) fn export(mut self, name: &str) -> Self {
        self.exports.push((name.to_string(), Entry::Code));
        self
    }

    pub(crate) fn null_export(mut self, name: &str) -> Self {
        self.exports.push((name.to_string(), Entry::Null));
        self
    }

    pub(crate) fn forwarded(mut self, name: &str, target: &str) -> Self {
        self.exports.push((name.to_string(), Entry::Forward(target.to_string())));
        self
    }

    /// Point name-table entry `index` at `ordinal` instead of its own slot
    pub(crate) fn with_ordinal(mut self, index: usize, ordinal: u16) -> Self {
        self.ordinal_overrides.push((index, ordinal));
        self
    }

    pub(crate) fn with_name_count(mut self, count: u32) -> Self {
        self.name_count = Some(count);
        self
    }

    /// Declare `count` address table entries regardless of how many exist
    pub(crate) fn with_function_count(mut self, count: u32) -> Self {
        self.function_count = Some(count);
        self
    }

    pub(crate) fn without_export_directory(mut self) -> Self {
        self.export_directory = false;
        self
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let count = self.exports.len();
        let functions_rva = EXPORT_DIR_RVA + 0x40;
        let ordinals_rva = functions_rva + count * 4;
        let names_rva = align(ordinals_rva + count * 2, 4);
        let strings_rva = names_rva + count * 4;

        let mut strings = Vec::new();
        let mut name_rvas = Vec::with_capacity(count);
        let mut forward_rvas = Vec::with_capacity(count);
        for (name, entry) in &self.exports {
            name_rvas.push(strings_rva + strings.len());
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
            if let Entry::Forward(target) = entry {
                forward_rvas.push(Some(strings_rva + strings.len()));
                strings.extend_from_slice(target.as_bytes());
                strings.push(0);
            } else {
                forward_rvas.push(None);
            }
        }
        let export_end = strings_rva + strings.len();
        let code_start = align(export_end, PAGE);
        let size = code_start + PAGE;

        let mut image = vec![0u8; size];
        put16(&mut image, 0, 0x5A4D);
        put32(&mut image, 0x3C, E_LFANEW as u32);

        let nt = E_LFANEW;
        put32(&mut image, nt, 0x0000_4550);
        put16(&mut image, nt + 4, if self.pe32_plus { 0x8664 } else { 0x14C });
        put16(&mut image, nt + 20, if self.pe32_plus { 0xF0 } else { 0xE0 });

        let optional = nt + 24;
        put16(&mut image, optional, if self.pe32_plus { 0x20B } else { 0x10B });
        put32(&mut image, optional + 56, size as u32);
        let (count_offset, dir_offset) = if self.pe32_plus { (108, 112) } else { (92, 96) };
        put32(&mut image, optional + count_offset, 16);

        if !self.export_directory {
            return image;
        }
        put32(&mut image, optional + dir_offset, EXPORT_DIR_RVA as u32);
        put32(&mut image, optional + dir_offset + 4, (export_end - EXPORT_DIR_RVA) as u32);

        put32(&mut image, EXPORT_DIR_RVA + 16, 1);
        put32(&mut image, EXPORT_DIR_RVA + 20, self.function_count.unwrap_or(count as u32));
        put32(&mut image, EXPORT_DIR_RVA + 24, self.name_count.unwrap_or(count as u32));
        put32(&mut image, EXPORT_DIR_RVA + 28, functions_rva as u32);
        put32(&mut image, EXPORT_DIR_RVA + 32, names_rva as u32);
        put32(&mut image, EXPORT_DIR_RVA + 36, ordinals_rva as u32);

        for (i, (_, entry)) in self.exports.iter().enumerate() {
            let function_rva = match entry {
                Entry::Code => code_start + i * 16,
                Entry::Null => 0,
                Entry::Forward(_) => forward_rvas[i].unwrap_or(0),
            };
            put32(&mut image, functions_rva + i * 4, function_rva as u32);

            let ordinal = self
                .ordinal_overrides
                .iter()
                .find(|(index, _)| *index == i)
                .map_or(i as u16, |(_, ordinal)| *ordinal);
            put16(&mut image, ordinals_rva + i * 2, ordinal);
            put32(&mut image, names_rva + i * 4, name_rvas[i] as u32);
        }

        image[strings_rva..export_end].copy_from_slice(&strings);
        image
    }
}

fn align(value: usize, to: usize) -> usize {
    (value + to - 1) & !(to - 1)
}

fn put16(image: &mut [u8], offset: usize, value: u16) {
    image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put32(image: &mut [u8], offset: usize, value: u32) {
    image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

// Callees that pop exactly `k` words on return, plus ones that fault, spin, or
// exhaust their stack.
#[cfg(all(
    any(target_arch = "x86", target_arch = "x86_64"),
    any(windows, target_os = "linux")
))]
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) mod callees {
    // 32-bit Windows decorates C symbols with a leading underscore.
    #[cfg(all(windows, target_arch = "x86"))]
    macro_rules! symbol {
        ($name:ident) => {
            concat!("_", stringify!($name))
        };
    }
    #[cfg(not(all(windows, target_arch = "x86")))]
    macro_rules! symbol {
        ($name:ident) => {
            stringify!($name)
        };
    }

    #[cfg(target_arch = "x86_64")]
    macro_rules! word {
        () => {
            "8"
        };
    }
    #[cfg(target_arch = "x86")]
    macro_rules! word {
        () => {
            "4"
        };
    }

    // Reads through the first argument register, which `measure` zeroes.
    #[cfg(target_arch = "x86_64")]
    macro_rules! load_through_first_arg {
        () => {
            "mov rax, qword ptr [rcx + 0x10]"
        };
    }
    #[cfg(target_arch = "x86")]
    macro_rules! load_through_first_arg {
        () => {
            "mov eax, dword ptr [ecx + 0x10]"
        };
    }

    macro_rules! callee_pops {
        ($($name:ident => $slots:literal),* $(,)?) => {
            $(
                core::arch::global_asm!(
                    ".text",
                    ".p2align 4",
                    concat!(".globl ", symbol!($name)),
                    concat!(symbol!($name), ":"),
                    "xor eax, eax",
                    concat!("ret ", $slots, " * ", word!()),
                );
            )*

            extern "C" {
                $(fn $name();)*
            }

            /// Entry points indexed by the number of words each one pops
            pub(crate) fn popping() -> Vec<usize> {
                vec![$($name as unsafe extern "C" fn() as usize),*]
            }
        };
    }

    callee_pops! {
        argprobe_fixture_pop_0 => 0,
        argprobe_fixture_pop_1 => 1,
        argprobe_fixture_pop_2 => 2,
        argprobe_fixture_pop_3 => 3,
        argprobe_fixture_pop_4 => 4,
        argprobe_fixture_pop_5 => 5,
        argprobe_fixture_pop_6 => 6,
        argprobe_fixture_pop_7 => 7,
        argprobe_fixture_pop_8 => 8,
        argprobe_fixture_pop_9 => 9,
        argprobe_fixture_pop_10 => 10,
        argprobe_fixture_pop_11 => 11,
        argprobe_fixture_pop_12 => 12,
        argprobe_fixture_pop_13 => 13,
        argprobe_fixture_pop_14 => 14,
        argprobe_fixture_pop_15 => 15,
        argprobe_fixture_pop_16 => 16,
    }

    // Pops twenty words: more than the synthetic frame holds.
    core::arch::global_asm!(
        ".text",
        ".p2align 4",
        concat!(".globl ", symbol!(argprobe_fixture_overpop)),
        concat!(symbol!(argprobe_fixture_overpop), ":"),
        concat!("ret 20 * ", word!()),
    );

    core::arch::global_asm!(
        ".text",
        ".p2align 4",
        concat!(".globl ", symbol!(argprobe_fixture_fault)),
        concat!(symbol!(argprobe_fixture_fault), ":"),
        load_through_first_arg!(),
        "ret",
    );

    core::arch::global_asm!(
        ".text",
        ".p2align 4",
        concat!(".globl ", symbol!(argprobe_fixture_spin)),
        concat!(symbol!(argprobe_fixture_spin), ":"),
        "2:",
        "pause",
        "jmp 2b",
    );

    // Pushes until the guard page trips.
    core::arch::global_asm!(
        ".text",
        ".p2align 4",
        concat!(".globl ", symbol!(argprobe_fixture_exhaust)),
        concat!(symbol!(argprobe_fixture_exhaust), ":"),
        "2:",
        "push 0",
        "jmp 2b",
    );

    extern "C" {
        fn argprobe_fixture_overpop();
        fn argprobe_fixture_fault();
        fn argprobe_fixture_spin();
        fn argprobe_fixture_exhaust();
    }

    pub(crate) fn overpop() -> usize {
        argprobe_fixture_overpop as unsafe extern "C" fn() as usize
    }

    pub(crate) fn fault() -> usize {
        argprobe_fixture_fault as unsafe extern "C" fn() as usize
    }

    pub(crate) fn spin() -> usize {
        argprobe_fixture_spin as unsafe extern "C" fn() as usize
    }

    pub(crate) fn exhaust() -> usize {
        argprobe_fixture_exhaust as unsafe extern "C" fn() as usize
    }
}
