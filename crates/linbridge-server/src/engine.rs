//! Inner engine capability.
//!
//! The server drives the wrapped engine only through [`InnerEngine`]. How an
//! engine is created from a module is up to an [`EngineFactory`]; the
//! default factory resolves an entry point exported by the module.

use crate::loader::{ModuleHandle, ModuleLoader};
use crate::relay::HostLink;
use linbridge_plugin::{
    BootArgs, BridgeError, EditorRect, EffectInfo, Event, LoadStage, PlugCategory, Precision,
    Result,
};
use std::sync::Arc;

/// Unified interface for the wrapped engine.
///
/// All methods take `&self`: the audio, parameter, control and editor loops
/// call in concurrently, so the engine owns its synchronization.
#[allow(unused_variables)]
pub trait InnerEngine: Send + Sync {
    fn info(&self) -> EffectInfo;

    /// Textual class identifier, used to derive a unique id when the engine
    /// reports none.
    fn class_id(&self) -> String {
        String::new()
    }

    fn open(&self) {}

    fn close(&self) {}

    fn suspend(&self) {}

    fn resume(&self) {}

    fn reset(&self) {
        self.suspend();
        self.resume();
    }

    fn set_sample_rate(&self, rate: f32) {}

    fn set_block_size(&self, frames: i32) {}

    fn name(&self) -> String {
        String::new()
    }

    fn vendor(&self) -> String {
        String::new()
    }

    fn product(&self) -> String {
        String::new()
    }

    fn vendor_version(&self) -> i32 {
        0
    }

    fn category(&self) -> PlugCategory {
        PlugCategory::Unknown
    }

    /// 1 = yes, -1 = no, 0 = don't know.
    fn can_do(&self, capability: &str) -> i32 {
        0
    }

    // Parameters (normalized 0..1)

    fn parameter(&self, index: i32) -> f32;

    fn set_parameter(&self, index: i32, value: f32);

    fn parameter_name(&self, index: i32) -> String {
        String::new()
    }

    fn parameter_label(&self, index: i32) -> String {
        String::new()
    }

    fn parameter_display(&self, index: i32) -> String {
        String::new()
    }

    fn can_be_automated(&self, index: i32) -> bool {
        true
    }

    // Programs

    fn program(&self) -> i32 {
        0
    }

    fn set_program(&self, index: i32) {}

    fn program_name(&self) -> String {
        String::new()
    }

    fn program_name_indexed(&self, index: i32) -> Option<String> {
        None
    }

    // State

    fn chunk(&self, preset: bool) -> Vec<u8> {
        Vec::new()
    }

    /// Returns the engine's status code for the restore.
    fn set_chunk(&self, data: &[u8], preset: bool) -> i32 {
        0
    }

    // Processing

    fn start_process(&self) {}

    fn stop_process(&self) {}

    fn set_precision(&self, precision: Precision) -> bool {
        precision == Precision::Single
    }

    /// Returns true if the engine accepted the events.
    fn process_events(&self, events: &[Event]) -> bool {
        false
    }

    fn process_replacing(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]);

    /// Returns false when double precision is unsupported; outputs are then
    /// left untouched.
    fn process_double_replacing(&self, inputs: &[&[f64]], outputs: &mut [&mut [f64]]) -> bool {
        false
    }

    // Editor

    /// Open the editor inside the native window `parent`.
    fn open_editor(&self, parent: u64) -> Option<EditorRect> {
        None
    }

    fn close_editor(&self) {}

    fn editor_rect(&self) -> Option<EditorRect> {
        None
    }

    fn editor_idle(&self) {}
}

/// Cross-process pointer and window-property tracking for drag-and-drop.
pub trait PointerTracker: Send {
    /// One sampling step. Called every millisecond or so.
    fn poll_once(&mut self);
}

/// Tracks nothing.
pub struct IdleTracker;

impl PointerTracker for IdleTracker {
    fn poll_once(&mut self) {}
}

/// Creates the inner engine for a session.
pub trait EngineFactory: Send + Sync {
    fn load_module(&self, args: &BootArgs) -> Result<ModuleHandle> {
        ModuleLoader::load(&args.path, args.module)
    }

    fn instantiate(&self, module: &ModuleHandle, host: HostLink) -> Result<Arc<dyn InnerEngine>>;

    fn pointer_tracker(&self) -> Option<Box<dyn PointerTracker>> {
        None
    }
}

/// Instantiates engines through the module's exported entry point.
pub struct EntryPointFactory;

impl EngineFactory for EntryPointFactory {
    fn instantiate(&self, module: &ModuleHandle, host: HostLink) -> Result<Arc<dyn InnerEngine>> {
        let entry = module.entry().ok_or_else(|| BridgeError::LoadFailed {
            path: module.path().to_path_buf(),
            stage: LoadStage::Instantiation,
            reason: "module has no engine entry point".to_string(),
        })?;

        let engine = entry(module.index().to_raw(), host).ok_or_else(|| BridgeError::LoadFailed {
            path: module.path().to_path_buf(),
            stage: LoadStage::Instantiation,
            reason: format!("no engine at index {}", module.index().to_raw()),
        })?;
        Ok(Arc::from(engine))
    }
}

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Stable 31-bit id from a class identifier (FNV-1a). Never 0 for a
/// non-empty identifier.
pub fn derive_unique_id(class_id: &str) -> i32 {
    if class_id.is_empty() {
        return 0;
    }
    let hash = class_id
        .bytes()
        .fold(FNV_OFFSET, |h, b| (h ^ b as u32).wrapping_mul(FNV_PRIME));
    match (hash & 0x7fff_ffff) as i32 {
        0 => 1,
        id => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_unique_id_is_stable() {
        let a = derive_unique_id("565354414256535374657265");
        assert_eq!(a, derive_unique_id("565354414256535374657265"));
        assert!(a > 0);
    }

    #[test]
    fn test_derive_unique_id_distinguishes() {
        assert_ne!(
            derive_unique_id("ABCDEF0123456789ABCDEF0123456789"),
            derive_unique_id("ABCDEF0123456789ABCDEF012345678A")
        );
        assert_eq!(derive_unique_id(""), 0);
    }

    #[test]
    fn test_known_fnv_value() {
        // FNV-1a("a") = 0xe40c292c
        assert_eq!(derive_unique_id("a"), (0xe40c_292c_u32 & 0x7fff_ffff) as i32);
    }

    struct Gain;

    impl InnerEngine for Gain {
        fn info(&self) -> EffectInfo {
            EffectInfo::default()
        }

        fn parameter(&self, _index: i32) -> f32 {
            0.0
        }

        fn set_parameter(&self, _index: i32, _value: f32) {}

        fn process_replacing(&self, _inputs: &[&[f32]], _outputs: &mut [&mut [f32]]) {}
    }

    #[test]
    fn test_engine_defaults() {
        let engine = Gain;
        assert!(engine.set_precision(Precision::Single));
        assert!(!engine.set_precision(Precision::Double));
        assert!(engine.open_editor(0).is_none());
        assert!(!engine.process_double_replacing(&[], &mut []));
        assert_eq!(engine.can_do("sendVstEvents"), 0);
    }

    #[test]
    fn test_entry_point_factory_requires_entry() {
        let module = ModuleHandle::detached("/p/Synth.dll", linbridge_plugin::ModuleIndex::Index(0));
        let err = EntryPointFactory
            .instantiate(&module, HostLink::detached())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            BridgeError::LoadFailed {
                stage: LoadStage::Instantiation,
                ..
            }
        ));
    }
}
