//! Minimal relocatable object writer.
//!
//! Produces an ELF64 relocatable with the generated code in `.text` and one
//! global function symbol, `bfmain`, spanning it. Linked against a small
//! wrapper that supplies a tape and a callback vector (see
//! `demos/wrapper.c`), the object becomes a standalone executable.

use std::io::{self, Write};

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 72; // three Elf64_Sym entries

/// Section header names, indexed by the sh_name offsets below.
const SHSTRTAB: &[u8] = b"\0.text\0.shstrtab\0.strtab\0.symtab\0";
/// Symbol names: the null name and `bfmain`.
const STRTAB: &[u8] = b"\0bfmain\0\0";

pub fn write_object(out: &mut dyn Write, code: &[u8]) -> io::Result<()> {
    let text_pos = EHDR_SIZE;
    let shstrtab_pos = text_pos + code.len();
    let strtab_pos = shstrtab_pos + SHSTRTAB.len();
    let symtab_pos = strtab_pos + STRTAB.len();
    let shdr_pos = symtab_pos + SYM_SIZE;

    let mut image = Vec::with_capacity(shdr_pos + 5 * SHDR_SIZE);

    // ELF header.
    image.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    push_u16(&mut image, 1); // ET_REL
    push_u16(&mut image, 62); // EM_X86_64
    push_u32(&mut image, 1); // EV_CURRENT
    push_u64(&mut image, 0); // entry
    push_u64(&mut image, 0); // program header offset
    push_u64(&mut image, shdr_pos as u64);
    push_u32(&mut image, 0); // flags
    push_u16(&mut image, EHDR_SIZE as u16);
    push_u16(&mut image, 0); // phentsize
    push_u16(&mut image, 0); // phnum
    push_u16(&mut image, SHDR_SIZE as u16);
    push_u16(&mut image, 5); // section count
    push_u16(&mut image, 2); // .shstrtab index
    debug_assert_eq!(image.len(), EHDR_SIZE);

    image.extend_from_slice(code);
    image.extend_from_slice(SHSTRTAB);
    image.extend_from_slice(STRTAB);

    // Symbol table: null symbol, a local section symbol for .text, and the
    // global bfmain covering the whole code section.
    push_sym(&mut image, 0, 0x00, 0, 0);
    push_sym(&mut image, 0, 0x03, 1, 0); // STB_LOCAL, STT_SECTION
    push_sym(&mut image, 1, 0x12, 1, code.len() as u64); // STB_GLOBAL, STT_FUNC

    // Section headers: null, .text, .shstrtab, .strtab, .symtab.
    push_shdr(&mut image, Shdr::default());
    push_shdr(&mut image, Shdr {
        name: 1,
        kind: 1, // PROGBITS
        flags: 6, // ALLOC | EXECINSTR
        offset: text_pos as u64,
        size: code.len() as u64,
        addralign: 16,
        ..Shdr::default()
    });
    push_shdr(&mut image, Shdr {
        name: 7,
        kind: 3, // STRTAB
        offset: shstrtab_pos as u64,
        size: SHSTRTAB.len() as u64,
        addralign: 1,
        ..Shdr::default()
    });
    push_shdr(&mut image, Shdr {
        name: 17,
        kind: 3,
        offset: strtab_pos as u64,
        size: STRTAB.len() as u64,
        addralign: 1,
        ..Shdr::default()
    });
    push_shdr(&mut image, Shdr {
        name: 25,
        kind: 2, // SYMTAB
        offset: symtab_pos as u64,
        size: SYM_SIZE as u64,
        link: 3, // its string table
        addralign: 8,
        entsize: 24,
        ..Shdr::default()
    });

    out.write_all(&image)
}

#[derive(Default)]
struct Shdr {
    name: u32,
    kind: u32,
    flags: u64,
    offset: u64,
    size: u64,
    link: u32,
    addralign: u64,
    entsize: u64,
}

fn push_u16(image: &mut Vec<u8>, value: u16) {
    image.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(image: &mut Vec<u8>, value: u32) {
    image.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(image: &mut Vec<u8>, value: u64) {
    image.extend_from_slice(&value.to_le_bytes());
}

fn push_sym(image: &mut Vec<u8>, name: u32, info: u8, shndx: u16, size: u64) {
    push_u32(image, name);
    image.push(info);
    image.push(0); // st_other
    push_u16(image, shndx);
    push_u64(image, 0); // st_value
    push_u64(image, size);
}

fn push_shdr(image: &mut Vec<u8>, shdr: Shdr) {
    push_u32(image, shdr.name);
    push_u32(image, shdr.kind);
    push_u64(image, shdr.flags);
    push_u64(image, 0); // sh_addr
    push_u64(image, shdr.offset);
    push_u64(image, shdr.size);
    push_u32(image, shdr.link);
    push_u32(image, 0); // sh_info
    push_u64(image, shdr.addralign);
    push_u64(image, shdr.entsize);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_for(code: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write_object(&mut out, code).unwrap();
        out
    }

    #[test]
    fn header_identifies_a_relocatable_x86_64_object() {
        let image = object_for(&[0xc3]);
        assert_eq!(&image[..4], b"\x7fELF");
        assert_eq!(image[4], 2); // 64-bit
        assert_eq!(image[5], 1); // little-endian
        assert_eq!(u16::from_le_bytes([image[16], image[17]]), 1); // ET_REL
        assert_eq!(u16::from_le_bytes([image[18], image[19]]), 62); // x86-64
        assert_eq!(u16::from_le_bytes([image[60], image[61]]), 5); // sections
        assert_eq!(u16::from_le_bytes([image[62], image[63]]), 2); // shstrndx
    }

    #[test]
    fn text_section_holds_the_code() {
        let code = [0x90, 0x90, 0xc3];
        let image = object_for(&code);
        assert_eq!(&image[EHDR_SIZE..EHDR_SIZE + code.len()], &code);
    }

    #[test]
    fn bfmain_symbol_spans_the_code() {
        let code = [0xc3; 17];
        let image = object_for(&code);
        let strtab_pos = EHDR_SIZE + code.len() + SHSTRTAB.len();
        assert_eq!(&image[strtab_pos..strtab_pos + 8], b"\0bfmain\0");

        // Third symbol: global function, section 1, size = code length.
        let symtab_pos = strtab_pos + STRTAB.len();
        let sym = &image[symtab_pos + 48..symtab_pos + 72];
        assert_eq!(u32::from_le_bytes(sym[0..4].try_into().unwrap()), 1);
        assert_eq!(sym[4], 0x12);
        assert_eq!(u16::from_le_bytes(sym[6..8].try_into().unwrap()), 1);
        assert_eq!(
            u64::from_le_bytes(sym[16..24].try_into().unwrap()),
            code.len() as u64
        );
    }

    #[test]
    fn section_headers_sit_at_the_recorded_offset() {
        let code = [0xc3; 5];
        let image = object_for(&code);
        let shoff = u64::from_le_bytes(image[40..48].try_into().unwrap()) as usize;
        assert_eq!(image.len(), shoff + 5 * SHDR_SIZE);
        // The .text header (index 1): PROGBITS, alloc+exec, offset 64.
        let text = &image[shoff + SHDR_SIZE..shoff + 2 * SHDR_SIZE];
        assert_eq!(u32::from_le_bytes(text[4..8].try_into().unwrap()), 1);
        assert_eq!(u64::from_le_bytes(text[8..16].try_into().unwrap()), 6);
        assert_eq!(u64::from_le_bytes(text[24..32].try_into().unwrap()), 64);
        assert_eq!(
            u64::from_le_bytes(text[32..40].try_into().unwrap()),
            code.len() as u64
        );
    }
}
