//! Binary assembly container.
//!
//! This is the bridge between the external assembler and the machine: a
//! versioned, little-endian dump of the constant pool, interface and class
//! tables, and every function with its stack maps and handler ranges. The
//! layout is private to this repository; the machine's input contract is
//! the in-memory [`Assembly`], not these bytes.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use bytecode::{
    ExceptionTable, HandlerRange, SlotBitmap, StackMapEntry, StackMapTable,
};
use object::{
    Class, ClassId, ClassTable, ElementKind, FunctionId, InterfaceId,
    InterfaceTable, ValueKind,
};

use crate::assembly::{
    Assembly, Constant, Function, InterfaceDecl, MethodSig, WellKnown,
};
use crate::error::HostError;

const IMAGE_MAGIC: &[u8; 8] = b"SABLEIMG";
const IMAGE_VERSION: u32 = 1;

/// Read an assembly image from disk. Structural errors surface as
/// [`HostError`]; in debug builds the bytecode is additionally re-verified
/// against its stored stack maps.
pub fn load_assembly(path: &Path) -> Result<Assembly, HostError> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != IMAGE_MAGIC {
        return Err(HostError::BadMagic);
    }
    let version = read_u32(&mut reader)?;
    if version != IMAGE_VERSION {
        return Err(HostError::UnsupportedVersion(version));
    }

    let assembly = read_body(&mut reader)?;

    #[cfg(debug_assertions)]
    assembly.validate().map_err(HostError::Invalid)?;

    Ok(assembly)
}

/// Write an assembly image. The inverse of [`load_assembly`].
pub fn write_assembly(assembly: &Assembly, path: &Path) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(IMAGE_MAGIC)?;
    write_u32(&mut writer, IMAGE_VERSION)?;
    write_body(&mut writer, assembly)?;
    writer.flush()
}

// ── body ──────────────────────────────────────────────────────────

fn write_body<W: Write>(w: &mut W, assembly: &Assembly) -> io::Result<()> {
    write_u32(w, assembly.constants.len() as u32)?;
    for constant in &assembly.constants {
        match constant {
            Constant::Int(n) => {
                write_u8(w, 0)?;
                write_u64(w, *n as u64)?;
            }
            Constant::Float(x) => {
                write_u8(w, 1)?;
                write_u64(w, x.to_bits())?;
            }
            Constant::Str(s) => {
                write_u8(w, 2)?;
                write_string(w, s)?;
            }
        }
    }

    write_u32(w, assembly.interfaces.len() as u32)?;
    for decl in &assembly.interfaces {
        write_string(w, &decl.name)?;
        write_u32(w, decl.methods.len() as u32)?;
        for method in &decl.methods {
            write_kinds(w, &method.params)?;
            write_ret(w, method.ret)?;
        }
    }

    write_u32(w, assembly.classes.len() as u32)?;
    for class in assembly.classes.iter() {
        write_string(w, &class.name)?;
        write_u32(w, class.base.map_or(u32::MAX, |b| b.0))?;
        write_u8(w, encode_element(class.element))?;
        write_kinds(w, &class.fields)?;
        write_kinds(w, &class.static_kinds)?;
        write_u32(w, class.vtable.len() as u32)?;
        for f in &class.vtable {
            write_u32(w, f.0)?;
        }
        write_u32(w, class.interfaces.len() as u32)?;
        for table in &class.interfaces {
            write_u32(w, table.interface.0)?;
            write_u32(w, table.methods.len() as u32)?;
            for f in &table.methods {
                write_u32(w, f.0)?;
            }
        }
    }

    write_u32(w, assembly.functions.len() as u32)?;
    for function in &assembly.functions {
        write_string(w, &function.name)?;
        write_kinds(w, &function.params)?;
        write_ret(w, function.ret)?;
        write_u32(w, function.local_count as u32)?;
        write_u32(w, function.max_stack as u32)?;
        write_u32(w, function.vtable_slot.map_or(u32::MAX, u32::from))?;
        write_u32(w, function.code.len() as u32)?;
        w.write_all(&function.code)?;

        write_u32(w, function.stack_maps.len() as u32)?;
        for entry in function.stack_maps.entries() {
            write_u32(w, entry.offset)?;
            write_u32(w, entry.live.len() as u32)?;
            let ones: Vec<usize> = entry.live.iter_ones().collect();
            write_u32(w, ones.len() as u32)?;
            for slot in ones {
                write_u32(w, slot as u32)?;
            }
        }

        write_u32(w, function.handlers.ranges().len() as u32)?;
        for range in function.handlers.ranges() {
            write_u32(w, range.start)?;
            write_u32(w, range.end)?;
            write_u32(w, range.handler)?;
            write_u32(w, range.class)?;
        }
    }

    let wk = assembly.well_known;
    for id in [
        wk.object,
        wk.string,
        wk.exception,
        wk.null_reference,
        wk.index_out_of_range,
        wk.divide_by_zero,
        wk.stack_overflow,
    ] {
        write_u32(w, id.0)?;
    }
    Ok(())
}

fn read_body<R: Read>(r: &mut R) -> Result<Assembly, HostError> {
    let constant_count = read_count(r, "constants")?;
    let mut constants = Vec::with_capacity(constant_count);
    for _ in 0..constant_count {
        constants.push(match read_u8(r)? {
            0 => Constant::Int(read_u64(r)? as i64),
            1 => Constant::Float(f64::from_bits(read_u64(r)?)),
            2 => Constant::Str(read_string(r)?),
            tag => return Err(corrupt(format!("constant tag {tag}"))),
        });
    }

    let interface_count = read_count(r, "interfaces")?;
    let mut interfaces = Vec::with_capacity(interface_count);
    for _ in 0..interface_count {
        let name = read_string(r)?;
        let method_count = read_count(r, "interface methods")?;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            methods.push(MethodSig {
                params: read_kinds(r)?,
                ret: read_ret(r)?,
            });
        }
        interfaces.push(InterfaceDecl { name, methods });
    }

    let class_count = read_count(r, "classes")?;
    let mut classes = Vec::with_capacity(class_count);
    for id in 0..class_count {
        let name = read_string(r)?;
        let base = match read_u32(r)? {
            u32::MAX => None,
            b if (b as usize) < id => Some(ClassId(b)),
            b => return Err(corrupt(format!("class base {b} out of order"))),
        };
        let element = decode_element(read_u8(r)?)?;
        let fields = read_kinds(r)?;
        let static_kinds = read_kinds(r)?;
        let mut class = Class::new(
            ClassId(id as u32),
            name,
            base,
            fields,
            element,
            &static_kinds,
        );
        let vtable_len = read_count(r, "vtable")?;
        for _ in 0..vtable_len {
            class.vtable.push(FunctionId(read_u32(r)?));
        }
        let table_count = read_count(r, "interface tables")?;
        for _ in 0..table_count {
            let interface = InterfaceId(read_u32(r)?);
            if interface.0 as usize >= interfaces.len() {
                return Err(corrupt("interface table id out of range".into()));
            }
            let method_count = read_count(r, "interface table methods")?;
            let mut methods = Vec::with_capacity(method_count);
            for _ in 0..method_count {
                methods.push(FunctionId(read_u32(r)?));
            }
            class.interfaces.push(InterfaceTable { interface, methods });
        }
        classes.push(class);
    }

    let function_count = read_count(r, "functions")?;
    let mut functions = Vec::with_capacity(function_count);
    for _ in 0..function_count {
        let name = read_string(r)?;
        let params = read_kinds(r)?;
        let ret = read_ret(r)?;
        let local_count = read_u32(r)?;
        let max_stack = read_u32(r)?;
        if local_count > u16::MAX as u32 || max_stack > u16::MAX as u32 {
            return Err(corrupt(format!("frame shape of `{name}` too large")));
        }
        let vtable_slot = match read_u32(r)? {
            u32::MAX => None,
            slot if slot <= u16::MAX as u32 => Some(slot as u16),
            slot => return Err(corrupt(format!("vtable slot {slot}"))),
        };
        let code_len = read_count(r, "bytecode")?;
        let mut code = vec![0u8; code_len];
        r.read_exact(&mut code).map_err(HostError::Io)?;

        let map_count = read_count(r, "stack maps")?;
        let mut entries = Vec::with_capacity(map_count);
        for _ in 0..map_count {
            let offset = read_u32(r)?;
            let len = read_count(r, "bitmap length")?;
            let mut live = SlotBitmap::new(len);
            let ones = read_count(r, "bitmap bits")?;
            for _ in 0..ones {
                let slot = read_u32(r)? as usize;
                if slot >= len {
                    return Err(corrupt("bitmap slot out of range".into()));
                }
                live.set(slot);
            }
            entries.push(StackMapEntry { offset, live });
        }

        let handler_count = read_count(r, "handlers")?;
        let mut ranges = Vec::with_capacity(handler_count);
        for _ in 0..handler_count {
            let range = HandlerRange {
                start: read_u32(r)?,
                end: read_u32(r)?,
                handler: read_u32(r)?,
                class: read_u32(r)?,
            };
            if range.start >= range.end {
                return Err(corrupt("empty handler range".into()));
            }
            ranges.push(range);
        }

        functions.push(Function {
            name,
            params,
            ret,
            local_count: local_count as u16,
            max_stack: max_stack as u16,
            vtable_slot,
            code,
            stack_maps: StackMapTable::from_entries(entries),
            handlers: ExceptionTable::from_ranges(ranges),
        });
    }

    // Cross-table references.
    for class in &classes {
        for f in class.vtable.iter().chain(
            class.interfaces.iter().flat_map(|t| t.methods.iter()),
        ) {
            if f.0 as usize >= functions.len() {
                return Err(corrupt(format!(
                    "class `{}` references missing function {}",
                    class.name, f.0
                )));
            }
        }
    }

    let mut wk_ids = [0u32; 7];
    for slot in &mut wk_ids {
        let id = read_u32(r)?;
        if id as usize >= classes.len() {
            return Err(corrupt(format!("well-known class {id} missing")));
        }
        *slot = id;
    }
    let well_known = WellKnown {
        object: ClassId(wk_ids[0]),
        string: ClassId(wk_ids[1]),
        exception: ClassId(wk_ids[2]),
        null_reference: ClassId(wk_ids[3]),
        index_out_of_range: ClassId(wk_ids[4]),
        divide_by_zero: ClassId(wk_ids[5]),
        stack_overflow: ClassId(wk_ids[6]),
    };

    Ok(Assembly::from_parts(
        functions,
        ClassTable::new(classes),
        interfaces,
        constants,
        well_known,
    ))
}

// ── primitives ────────────────────────────────────────────────────

const MAX_COUNT: usize = 1 << 24;

fn corrupt(message: String) -> HostError {
    HostError::Corrupt(message)
}

fn read_count<R: Read>(r: &mut R, what: &str) -> Result<usize, HostError> {
    let count = read_u32(r)? as usize;
    if count > MAX_COUNT {
        return Err(corrupt(format!("unreasonable {what} count {count}")));
    }
    Ok(count)
}

fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn write_kinds<W: Write>(w: &mut W, kinds: &[ValueKind]) -> io::Result<()> {
    write_u32(w, kinds.len() as u32)?;
    for &kind in kinds {
        write_u8(w, encode_kind(kind))?;
    }
    Ok(())
}

fn write_ret<W: Write>(w: &mut W, ret: Option<ValueKind>) -> io::Result<()> {
    match ret {
        None => write_u8(w, 0),
        Some(kind) => write_u8(w, 1 + encode_kind(kind)),
    }
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8, HostError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, HostError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, HostError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string<R: Read>(r: &mut R) -> Result<String, HostError> {
    let len = read_count(r, "string length")?;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| corrupt("string not UTF-8".into()))
}

fn read_kinds<R: Read>(r: &mut R) -> Result<Vec<ValueKind>, HostError> {
    let len = read_count(r, "kind list")?;
    let mut kinds = Vec::with_capacity(len);
    for _ in 0..len {
        kinds.push(decode_kind(read_u8(r)?)?);
    }
    Ok(kinds)
}

fn read_ret<R: Read>(r: &mut R) -> Result<Option<ValueKind>, HostError> {
    match read_u8(r)? {
        0 => Ok(None),
        tag => Ok(Some(decode_kind(tag - 1)?)),
    }
}

fn encode_kind(kind: ValueKind) -> u8 {
    match kind {
        ValueKind::Int => 0,
        ValueKind::Float => 1,
        ValueKind::Ref => 2,
    }
}

fn decode_kind(tag: u8) -> Result<ValueKind, HostError> {
    match tag {
        0 => Ok(ValueKind::Int),
        1 => Ok(ValueKind::Float),
        2 => Ok(ValueKind::Ref),
        tag => Err(corrupt(format!("value kind tag {tag}"))),
    }
}

fn encode_element(element: Option<ElementKind>) -> u8 {
    match element {
        None => 0,
        Some(ElementKind::Int) => 1,
        Some(ElementKind::Float) => 2,
        Some(ElementKind::Ref) => 3,
        Some(ElementKind::Byte) => 4,
    }
}

fn decode_element(tag: u8) -> Result<Option<ElementKind>, HostError> {
    match tag {
        0 => Ok(None),
        1 => Ok(Some(ElementKind::Int)),
        2 => Ok(Some(ElementKind::Float)),
        3 => Ok(Some(ElementKind::Ref)),
        4 => Ok(Some(ElementKind::Byte)),
        tag => Err(corrupt(format!("element kind tag {tag}"))),
    }
}
