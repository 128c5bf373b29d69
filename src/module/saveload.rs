use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::VkrtError;

use super::{ArgType, FunctionInfo, VulkanShader};

/// Magic number of the on-disk module container.
pub const MODULE_MAGIC: u32 = 0x0270_0027;
/// Format string of the stream container.
pub const MODULE_FORMAT: &str = "vulkan";

fn write_u32(w: &mut impl Write, v: u32) -> Result<(), VkrtError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_u64(w: &mut impl Write, v: u64) -> Result<(), VkrtError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_string(w: &mut impl Write, s: &str) -> Result<(), VkrtError> {
    write_u64(w, s.len() as u64)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn read_u32(r: &mut impl Read) -> Result<u32, VkrtError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64, VkrtError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string(r: &mut impl Read) -> Result<String, VkrtError> {
    let len = read_u64(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| VkrtError::ModuleFormat("string record is not UTF-8".into()))
}

impl ArgType {
    // DLPack-style type codes
    fn to_wire(self) -> (u8, u8) {
        match self {
            ArgType::Int(bits) => (0, bits),
            ArgType::UInt(bits) => (1, bits),
            ArgType::Float(bits) => (2, bits),
            ArgType::Handle => (3, 64),
        }
    }

    fn from_wire(code: u8, bits: u8) -> Result<Self, VkrtError> {
        match code {
            0 => Ok(ArgType::Int(bits)),
            1 => Ok(ArgType::UInt(bits)),
            2 => Ok(ArgType::Float(bits)),
            3 => Ok(ArgType::Handle),
            _ => Err(VkrtError::ModuleFormat(format!(
                "unknown argument type code {}",
                code
            ))),
        }
    }
}

fn write_function_info(w: &mut impl Write, info: &FunctionInfo) -> Result<(), VkrtError> {
    write_u64(w, info.arg_types.len() as u64)?;
    for arg in &info.arg_types {
        let (code, bits) = arg.to_wire();
        w.write_all(&[code, bits])?;
        write_u64(w, 1)?; // lanes
    }
    write_u64(w, info.thread_axis_tags.len() as u64)?;
    for tag in &info.thread_axis_tags {
        write_string(w, tag)?;
    }
    Ok(())
}

fn read_function_info(r: &mut impl Read) -> Result<FunctionInfo, VkrtError> {
    let num_args = read_u64(r)? as usize;
    let mut arg_types = Vec::with_capacity(num_args);
    for _ in 0..num_args {
        let mut code_bits = [0u8; 2];
        r.read_exact(&mut code_bits)?;
        let lanes = read_u64(r)?;
        if lanes != 1 {
            return Err(VkrtError::ModuleFormat(format!(
                "vector arguments are not supported (lanes = {})",
                lanes
            )));
        }
        arg_types.push(ArgType::from_wire(code_bits[0], code_bits[1])?);
    }
    let num_tags = read_u64(r)? as usize;
    let mut thread_axis_tags = Vec::with_capacity(num_tags);
    for _ in 0..num_tags {
        thread_axis_tags.push(read_string(r)?);
    }
    Ok(FunctionInfo {
        arg_types,
        thread_axis_tags,
    })
}

fn write_fmap(w: &mut impl Write, fmap: &HashMap<String, FunctionInfo>) -> Result<(), VkrtError> {
    // sorted for a deterministic byte stream
    let mut names: Vec<&String> = fmap.keys().collect();
    names.sort();
    write_u64(w, names.len() as u64)?;
    for name in names {
        write_string(w, name)?;
        write_function_info(w, &fmap[name])?;
    }
    Ok(())
}

fn read_fmap(r: &mut impl Read) -> Result<HashMap<String, FunctionInfo>, VkrtError> {
    let count = read_u64(r)? as usize;
    let mut fmap = HashMap::with_capacity(count);
    for _ in 0..count {
        let name = read_string(r)?;
        let info = read_function_info(r)?;
        fmap.insert(name, info);
    }
    Ok(fmap)
}

fn write_smap(w: &mut impl Write, smap: &HashMap<String, VulkanShader>) -> Result<(), VkrtError> {
    let mut names: Vec<&String> = smap.keys().collect();
    names.sort();
    write_u64(w, names.len() as u64)?;
    for name in names {
        let shader = &smap[name];
        write_string(w, name)?;
        write_u32(w, shader.flags)?;
        write_u64(w, shader.data.len() as u64)?;
        for word in &shader.data {
            write_u32(w, *word)?;
        }
    }
    Ok(())
}

fn read_smap(r: &mut impl Read) -> Result<HashMap<String, VulkanShader>, VkrtError> {
    let count = read_u64(r)? as usize;
    let mut smap = HashMap::with_capacity(count);
    for _ in 0..count {
        let name = read_string(r)?;
        let flags = read_u32(r)?;
        let num_words = read_u64(r)? as usize;
        let mut data = Vec::with_capacity(num_words);
        for _ in 0..num_words {
            data.push(read_u32(r)?);
        }
        smap.insert(name, VulkanShader { flags, data });
    }
    Ok(smap)
}

/// Stream form: format string, function-info table, shader table.
pub(crate) fn write_stream(
    w: &mut impl Write,
    fmap: &HashMap<String, FunctionInfo>,
    smap: &HashMap<String, VulkanShader>,
) -> Result<(), VkrtError> {
    write_string(w, MODULE_FORMAT)?;
    write_fmap(w, fmap)?;
    write_smap(w, smap)
}

pub(crate) fn read_stream(
    r: &mut impl Read,
) -> Result<(HashMap<String, FunctionInfo>, HashMap<String, VulkanShader>), VkrtError> {
    let fmt = read_string(r)?;
    if fmt != MODULE_FORMAT {
        return Err(VkrtError::ModuleFormat(format!(
            "expected format {:?}, found {:?}",
            MODULE_FORMAT, fmt
        )));
    }
    let fmap = read_fmap(r)?;
    let smap = read_smap(r)?;
    Ok((fmap, smap))
}

/// File form: magic then shader table. The function-info table goes to the
/// sibling meta file.
pub(crate) fn write_file_payload(
    w: &mut impl Write,
    smap: &HashMap<String, VulkanShader>,
) -> Result<(), VkrtError> {
    write_u32(w, MODULE_MAGIC)?;
    write_smap(w, smap)
}

pub(crate) fn read_file_payload(
    r: &mut impl Read,
) -> Result<HashMap<String, VulkanShader>, VkrtError> {
    let magic = read_u32(r)?;
    if magic != MODULE_MAGIC {
        return Err(VkrtError::ModuleFormat(format!(
            "module magic mismatch: {:#010x}",
            magic
        )));
    }
    read_smap(r)
}

pub(crate) fn meta_file_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".json");
    PathBuf::from(p)
}

pub(crate) fn write_meta_file(
    path: &Path,
    fmap: &HashMap<String, FunctionInfo>,
) -> Result<(), VkrtError> {
    let json = serde_json::to_string_pretty(fmap)
        .map_err(|e| VkrtError::ModuleFormat(e.to_string()))?;
    std::fs::write(path, json)?;
    Ok(())
}

pub(crate) fn read_meta_file(path: &Path) -> Result<HashMap<String, FunctionInfo>, VkrtError> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| VkrtError::ModuleFormat(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_maps() -> (HashMap<String, FunctionInfo>, HashMap<String, VulkanShader>) {
        let mut fmap = HashMap::new();
        fmap.insert(
            "copy_kernel".to_string(),
            FunctionInfo {
                arg_types: vec![ArgType::Handle, ArgType::Handle, ArgType::Int(32)],
                thread_axis_tags: vec!["blockIdx.x".to_string(), "threadIdx.x".to_string()],
            },
        );
        fmap.insert(
            "fill_kernel".to_string(),
            FunctionInfo {
                arg_types: vec![ArgType::Handle, ArgType::Float(32)],
                thread_axis_tags: vec!["blockIdx.x".to_string()],
            },
        );
        let mut smap = HashMap::new();
        smap.insert(
            "copy_kernel".to_string(),
            VulkanShader {
                flags: 0,
                data: vec![0x0723_0203, 0x0001_0000, 42],
            },
        );
        smap.insert(
            "fill_kernel".to_string(),
            VulkanShader {
                flags: VulkanShader::FLAG_USE_UBO,
                data: vec![0x0723_0203],
            },
        );
        (fmap, smap)
    }

    #[test]
    fn stream_round_trip_preserves_both_tables() {
        let (fmap, smap) = sample_maps();
        let mut bytes = Vec::new();
        write_stream(&mut bytes, &fmap, &smap).unwrap();
        let (fmap2, smap2) = read_stream(&mut bytes.as_slice()).unwrap();
        assert_eq!(fmap, fmap2);
        assert_eq!(smap, smap2);
    }

    #[test]
    fn stream_rejects_unknown_format() {
        let mut bytes = Vec::new();
        write_string(&mut bytes, "cuda").unwrap();
        assert!(read_stream(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn file_payload_round_trips_and_checks_magic() {
        let (_, smap) = sample_maps();
        let mut bytes = Vec::new();
        write_file_payload(&mut bytes, &smap).unwrap();
        assert_eq!(&bytes[..4], &MODULE_MAGIC.to_le_bytes());
        let smap2 = read_file_payload(&mut bytes.as_slice()).unwrap();
        assert_eq!(smap, smap2);

        bytes[0] ^= 0xff;
        assert!(read_file_payload(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn truncated_streams_error_out() {
        let (fmap, smap) = sample_maps();
        let mut bytes = Vec::new();
        write_stream(&mut bytes, &fmap, &smap).unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(read_stream(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn meta_file_round_trips_through_json() {
        let (fmap, _) = sample_maps();
        let dir = tempfile::tempdir().unwrap();
        let path = meta_file_path(&dir.path().join("mod.vulkan"));
        assert!(path.to_string_lossy().ends_with("mod.vulkan.json"));
        write_meta_file(&path, &fmap).unwrap();
        assert_eq!(read_meta_file(&path).unwrap(), fmap);
    }

    #[test]
    fn arg_type_wire_codes_round_trip() {
        for arg in [
            ArgType::Handle,
            ArgType::Int(32),
            ArgType::Int(64),
            ArgType::UInt(8),
            ArgType::Float(16),
        ] {
            let (code, bits) = arg.to_wire();
            assert_eq!(ArgType::from_wire(code, bits).unwrap(), arg);
        }
        assert!(ArgType::from_wire(9, 32).is_err());
    }
}
