//! Locating the engine module that a host-side wrapper stands for.
//!
//! A wrapper `Synth.so` maps to `Synth.vst3` or `Synth.dll` in the same
//! directory. A wrapper named `Synth-part-2.so` maps to the same container
//! but selects sub-module 2.

use crate::bootstrap::ModuleIndex;
use crate::error::{BridgeError, LoadStage, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const PART_MARKER: &str = "-part-";
const MODULE_EXTENSIONS: [&str; 6] = ["vst3", "Vst3", "VST3", "dll", "Dll", "DLL"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeMachine {
    X86_64,
    Ia64,
    I386,
    Unknown(u16),
}

impl PeMachine {
    fn from_raw(raw: u16) -> Self {
        match raw {
            0x8664 => PeMachine::X86_64,
            0x0200 => PeMachine::Ia64,
            0x014c => PeMachine::I386,
            other => PeMachine::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    pub path: PathBuf,
    pub index: ModuleIndex,
}

/// Split `Synth-part-2` into `("Synth", Index(2))`.
pub fn split_part_suffix(stem: &str) -> (&str, ModuleIndex) {
    if let Some(pos) = stem.rfind(PART_MARKER) {
        let digits = &stem[pos + PART_MARKER.len()..];
        if let Ok(index) = digits.parse::<u32>() {
            return (&stem[..pos], ModuleIndex::Index(index));
        }
    }
    (stem, ModuleIndex::FirstCompatible)
}

fn load_failed(path: &Path, reason: impl Into<String>) -> BridgeError {
    BridgeError::LoadFailed {
        path: path.to_path_buf(),
        stage: LoadStage::Resolving,
        reason: reason.into(),
    }
}

pub fn resolve_module(wrapper: &Path) -> Result<ModuleSpec> {
    let stem = wrapper
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| load_failed(wrapper, "wrapper has no file name"))?;
    let dir = wrapper.parent().unwrap_or_else(|| Path::new("."));
    let (base, index) = split_part_suffix(stem);

    let path = MODULE_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{base}.{ext}")))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| load_failed(wrapper, format!("no engine module named {base} next to it")))?;

    check_pe_architecture(&path)?;
    tracing::debug!(module = %path.display(), ?index, "resolved engine module");
    Ok(ModuleSpec { path, index })
}

pub fn pe_machine(path: &Path) -> Result<PeMachine> {
    let mut file = File::open(path)?;

    let mut dos = [0u8; 64];
    file.read_exact(&mut dos)
        .map_err(|_| load_failed(path, "file too short for a DOS header"))?;
    if &dos[..2] != b"MZ" {
        return Err(load_failed(path, "missing MZ signature"));
    }

    let pe_offset = u32::from_le_bytes([dos[0x3c], dos[0x3d], dos[0x3e], dos[0x3f]]);
    file.seek(SeekFrom::Start(pe_offset as u64))?;
    let mut header = [0u8; 6];
    file.read_exact(&mut header)
        .map_err(|_| load_failed(path, "PE header past end of file"))?;
    if &header[..4] != b"PE\0\0" {
        return Err(load_failed(path, "missing PE signature"));
    }

    Ok(PeMachine::from_raw(u16::from_le_bytes([header[4], header[5]])))
}

/// Only 64-bit modules can be hosted by the 64-bit server.
pub fn check_pe_architecture(path: &Path) -> Result<()> {
    match pe_machine(path)? {
        PeMachine::X86_64 | PeMachine::Ia64 => Ok(()),
        PeMachine::I386 => Err(load_failed(path, "32-bit module, 64-bit required")),
        PeMachine::Unknown(raw) => Err(load_failed(
            path,
            format!("unsupported machine type {raw:#06x}"),
        )),
    }
}
