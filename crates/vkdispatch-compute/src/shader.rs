use std::io::Cursor;
use std::path::Path;

use ash::vk;
use tracing::debug;

use crate::error::{vk_call, SetupError};

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Load a shader as SPIR-V words. Files ending in `.wgsl` are compiled with
/// naga; anything else is read as a SPIR-V binary.
pub fn load_shader(path: &Path) -> Result<Vec<u32>, SetupError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("wgsl") => compile_wgsl(path),
        _ => read_shader(path),
    }
}

/// Read a compiled SPIR-V binary as 32-bit words.
///
/// A missing or unreadable file is a [`SetupError::ShaderRead`]; a file whose
/// length is not a whole number of words, or that does not start with the
/// SPIR-V magic number, is [`SetupError::InvalidSpirv`].
pub fn read_shader(path: &Path) -> Result<Vec<u32>, SetupError> {
    let bytes = std::fs::read(path).map_err(|source| SetupError::ShaderRead {
        path: path.to_path_buf(),
        source,
    })?;
    let invalid = |reason: String| SetupError::InvalidSpirv {
        path: path.to_path_buf(),
        reason,
    };

    check_spirv_header(&bytes).map_err(invalid)?;
    // Byte-swaps big-endian modules.
    let words = ash::util::read_spv(&mut Cursor::new(&bytes)).map_err(|e| invalid(e.to_string()))?;

    debug!("read {} SPIR-V words from {}", words.len(), path.display());
    Ok(words)
}

/// Reject byte streams that cannot be a SPIR-V module: empty, not a whole
/// number of words, or not starting with the magic number in either byte
/// order.
fn check_spirv_header(bytes: &[u8]) -> Result<(), String> {
    if bytes.is_empty() {
        return Err("file is empty".to_string());
    }
    if bytes.len() % 4 != 0 {
        return Err(format!("length {} is not a multiple of 4", bytes.len()));
    }
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != SPIRV_MAGIC && magic != SPIRV_MAGIC.swap_bytes() {
        return Err(format!("bad magic number 0x{:08x}", magic));
    }
    Ok(())
}

/// Compile a WGSL source file to SPIR-V with every entry point it declares.
pub fn compile_wgsl(path: &Path) -> Result<Vec<u32>, SetupError> {
    let source = std::fs::read_to_string(path).map_err(|source| SetupError::ShaderRead {
        path: path.to_path_buf(),
        source,
    })?;
    let compile_error = |reason: String| SetupError::ShaderCompile {
        path: path.to_path_buf(),
        reason,
    };

    let module = naga::front::wgsl::parse_str(&source)
        .map_err(|e| compile_error(e.emit_to_string(&source)))?;
    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::empty(),
    )
    .validate(&module)
    .map_err(|e| compile_error(e.to_string()))?;

    let options = naga::back::spv::Options {
        lang_version: (1, 0),
        ..Default::default()
    };
    let mut writer =
        naga::back::spv::Writer::new(&options).map_err(|e| compile_error(e.to_string()))?;
    let mut words = Vec::new();
    writer
        .write(&module, &info, None, &None, &mut words)
        .map_err(|e| compile_error(e.to_string()))?;

    debug!("compiled {} to {} SPIR-V words", path.display(), words.len());
    Ok(words)
}

/// Build a shader module from SPIR-V words.
pub fn create_shader_module(
    device: &ash::Device,
    code: &[u32],
) -> Result<vk::ShaderModule, SetupError> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);
    unsafe { device.create_shader_module(&create_info, None) }
        .map_err(vk_call("vkCreateShaderModule"))
}

#[cfg(test)]
mod tests {
    use std::io::{ErrorKind, Write};

    use super::*;

    fn spirv_file(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = read_shader(Path::new("/nonexistent/shader.spv")).unwrap_err();
        match err {
            SetupError::ShaderRead { path, source } => {
                assert_eq!(path, Path::new("/nonexistent/shader.spv"));
                assert_eq!(source.kind(), ErrorKind::NotFound);
            }
            other => panic!("expected ShaderRead, got {:?}", other),
        }
    }

    #[test]
    fn unaligned_length_is_rejected() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.push(0);
        let file = spirv_file(&bytes);
        assert!(matches!(
            read_shader(file.path()),
            Err(SetupError::InvalidSpirv { .. })
        ));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let file = spirv_file(&0xdead_beefu32.to_le_bytes());
        let err = read_shader(file.path()).unwrap_err();
        assert!(matches!(err, SetupError::InvalidSpirv { .. }));
        assert!(err.to_string().contains("0xdeadbeef"), "{}", err);
    }

    #[test]
    fn big_endian_module_is_byte_swapped() {
        let mut bytes = Vec::new();
        for word in [SPIRV_MAGIC, 0x0001_0000, 7] {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        let file = spirv_file(&bytes);
        assert_eq!(read_shader(file.path()).unwrap(), vec![SPIRV_MAGIC, 0x0001_0000, 7]);
    }

    #[test]
    fn empty_file_is_rejected() {
        let file = spirv_file(&[]);
        let err = read_shader(file.path()).unwrap_err();
        assert!(matches!(err, SetupError::InvalidSpirv { .. }));
        assert!(err.to_string().contains("file is empty"), "{}", err);
    }

    #[test]
    fn words_are_read_in_order() {
        let mut bytes = Vec::new();
        for word in [SPIRV_MAGIC, 0x0001_0000, 7, 42] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let file = spirv_file(&bytes);
        assert_eq!(read_shader(file.path()).unwrap(), vec![SPIRV_MAGIC, 0x0001_0000, 7, 42]);
    }

    #[test]
    fn bundled_identity_shader_compiles() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../shaders/identity.wgsl");
        let words = load_shader(&path).unwrap();
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn broken_wgsl_is_a_compile_error() {
        let mut file = tempfile::Builder::new().suffix(".wgsl").tempfile().unwrap();
        file.write_all(b"@compute @workgroup_size(1) fn main( {").unwrap();
        file.flush().unwrap();
        assert!(matches!(
            load_shader(file.path()),
            Err(SetupError::ShaderCompile { .. })
        ));
    }

    #[test]
    fn non_wgsl_paths_are_read_as_spirv() {
        let file = spirv_file(&0xdead_beefu32.to_le_bytes());
        assert!(matches!(
            load_shader(file.path()),
            Err(SetupError::InvalidSpirv { .. })
        ));
    }
}
