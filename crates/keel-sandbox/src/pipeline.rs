//! Assemble, link and run pipeline for native snippets.
//!
//! Each stage is an independent [`ProcessExecutor::execute`] call in the
//! sandbox root. The first stage with a non-zero return code ends the
//! pipeline and its result is returned tagged with that stage.

use crate::error::{Result, SandboxError};
use crate::exec::{ExecutionResult, ProcessExecutor, Stage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use tracing::{debug, info};

/// Return code reported for a stage whose program could not be launched.
pub const LAUNCH_FAILURE_RETURN_CODE: i32 = 127;

/// Programs and argument templates for the pipeline.
///
/// Templates may reference `{src}`, `{obj}` and `{exe}`, which expand to the
/// file names derived from the output name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toolchain {
    /// Assembler program (default: `nasm`).
    pub assembler: String,
    /// Assembler arguments.
    pub assembler_args: Vec<String>,
    /// Linker program (default: `gcc`).
    pub linker: String,
    /// Linker arguments.
    pub linker_args: Vec<String>,
    /// Extension of the written source file (default: `asm`).
    pub source_extension: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            assembler: "nasm".into(),
            assembler_args: ["-f", "elf64", "{src}", "-o", "{obj}"]
                .map(String::from)
                .to_vec(),
            linker: "gcc".into(),
            linker_args: ["{obj}", "-o", "{exe}", "-no-pie"].map(String::from).to_vec(),
            source_extension: "asm".into(),
        }
    }
}

/// File names used by one pipeline run.
struct Artifacts {
    src: String,
    obj: String,
    exe: String,
}

impl Artifacts {
    fn expand(&self, templates: &[String]) -> Vec<String> {
        templates
            .iter()
            .map(|t| {
                t.replace("{src}", &self.src)
                    .replace("{obj}", &self.obj)
                    .replace("{exe}", &self.exe)
            })
            .collect()
    }
}

impl ProcessExecutor {
    /// Write `source` into the sandbox, then assemble, link and run it.
    ///
    /// # Errors
    /// [`SandboxError::AccessDenied`] if `output_name` is not a plain file
    /// name, [`SandboxError::Io`] if the source cannot be written.
    pub fn compile_and_run(&self, source: &str, output_name: &str) -> Result<ExecutionResult> {
        validate_output_name(output_name)?;

        let toolchain = self.toolchain().clone();
        let artifacts = Artifacts {
            src: format!("{}.{}", output_name, toolchain.source_extension),
            obj: format!("{}.o", output_name),
            exe: output_name.to_string(),
        };

        let src_path = self.root().join(&artifacts.src);
        fs::write(&src_path, source).map_err(|e| SandboxError::io(&artifacts.src, e))?;
        debug!(path = %src_path.display(), len = source.len(), "source written");

        let assembled = self.run_stage(
            &toolchain.assembler,
            &artifacts.expand(&toolchain.assembler_args),
            Stage::Compilation,
        )?;
        if !assembled.success() {
            info!(output = %output_name, return_code = assembled.return_code, "assembly failed");
            return Ok(assembled);
        }

        let linked = self.run_stage(
            &toolchain.linker,
            &artifacts.expand(&toolchain.linker_args),
            Stage::Linking,
        )?;
        if !linked.success() {
            info!(output = %output_name, return_code = linked.return_code, "linking failed");
            return Ok(linked);
        }

        let program = format!("./{}", artifacts.exe);
        let ran = self.run_stage(&program, &[], Stage::Execution)?;
        debug!(output = %output_name, return_code = ran.return_code, "pipeline finished");
        Ok(ran)
    }

    fn run_stage(&self, program: &str, args: &[String], stage: Stage) -> Result<ExecutionResult> {
        debug!(stage = %stage, program = %program, "running pipeline stage");
        match self.execute(program, args, &HashMap::new(), true) {
            Ok(result) => Ok(result.with_stage(stage)),
            Err(SandboxError::Spawn { command, source }) => Ok(ExecutionResult {
                stdout: String::new(),
                stderr: format!("failed to launch '{}': {}", command, source),
                return_code: LAUNCH_FAILURE_RETURN_CODE,
                stage: Some(stage),
            }),
            Err(e) => Err(e),
        }
    }
}

fn validate_output_name(name: &str) -> Result<()> {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\0');
    if plain {
        Ok(())
    } else {
        Err(SandboxError::denied(name, "output name must be a single file name"))
    }
}
