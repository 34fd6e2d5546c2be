//! Structural checks for newly deployed WASM code.

use crate::error::VmError;
use wasmtime::{Config, Engine, ExternType, Module};

/// Module from which contracts may import host functions
pub const HOST_IMPORT_MODULE: &str = "env";

/// Verifies that deployed code is a well-formed WASM module whose exported
/// functions take no parameters and return nothing, and which only imports
/// host functions.
pub struct WasmCodeVerifier {
    engine: Engine,
}

impl WasmCodeVerifier {
    pub fn new() -> Result<Self, VmError> {
        let mut config = Config::new();
        config
            .wasm_bulk_memory(true)
            .wasm_multi_value(true)
            .wasm_reference_types(false);

        let engine =
            Engine::new(&config).map_err(|e| VmError::Engine(format!("Failed to create engine: {}", e)))?;
        Ok(Self { engine })
    }

    pub fn verify(&self, code: &[u8]) -> Result<(), VmError> {
        let module = Module::new(&self.engine, code).map_err(|e| {
            tracing::debug!(error = %e, "rejected code: not a valid module");
            VmError::ContractInvalid
        })?;

        for import in module.imports() {
            if import.module() != HOST_IMPORT_MODULE {
                tracing::debug!(module = import.module(), name = import.name(), "rejected code: foreign import");
                return Err(VmError::ContractInvalid);
            }
        }

        for export in module.exports() {
            if let ExternType::Func(func) = export.ty() {
                if func.params().len() > 0 || func.results().len() > 0 {
                    tracing::debug!(name = export.name(), "rejected code: exported function has a signature");
                    return Err(VmError::ContractInvalid);
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for WasmCodeVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WasmCodeVerifier")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verify_wat(text: &str) -> Result<(), VmError> {
        let code = wat::parse_str(text).unwrap();
        WasmCodeVerifier::new().unwrap().verify(&code)
    }

    #[test]
    fn test_accepts_contract_module() {
        let result = verify_wat(
            r#"(module
                (import "env" "finish" (func $finish (param i32 i32)))
                (memory (export "memory") 1)
                (func (export "init"))
                (func (export "increment") (call $finish (i32.const 0) (i32.const 0))))"#,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_rejects_garbage() {
        let verifier = WasmCodeVerifier::new().unwrap();
        assert_eq!(verifier.verify(b"not wasm"), Err(VmError::ContractInvalid));
    }

    #[test]
    fn test_rejects_exported_signature() {
        let result = verify_wat(r#"(module (func (export "add") (param i32) (result i32) local.get 0))"#);
        assert_eq!(result, Err(VmError::ContractInvalid));
    }

    #[test]
    fn test_rejects_foreign_import() {
        let result = verify_wat(r#"(module (import "wasi" "fd_write" (func)) (func (export "init")))"#);
        assert_eq!(result, Err(VmError::ContractInvalid));
    }
}
