//! irgen driver.
//!
//! Builds a sample module (or parses a textual IR file), verifies it, writes
//! the textual IR and assembly artifacts, optionally writes an ELF object and
//! runs the entry function.

use clap::{Parser, ValueEnum};
use irgen::backend::interp::InterpreterBackend;
use irgen::backend::{
    CodeModel, ExecutionBackend, ExecutionEngine, GenericValue, JitOptions, MachineConfig,
    OptLevel, OutputKind, RelocModel, TargetLowering, VerifiedModule,
};
use irgen::core::StructuralVerifier;
use irgen::samples::Sample;
use irgen::x64::X64Lowering;
use irgen::{parse_module, print_module, Module};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "irgen")]
#[command(about = "Build, verify, lower and run IR modules")]
#[command(version)]
struct Cli {
    /// Built-in sample program to build (a, b or c)
    #[arg(long, conflicts_with = "input", required_unless_present = "input")]
    sample: Option<Sample>,

    /// Textual IR file to read instead of a sample
    #[arg(long)]
    input: Option<PathBuf>,

    /// Output path for the textual IR (default: <name>.ll)
    #[arg(long)]
    ir_out: Option<PathBuf>,

    /// Output path for the assembly text (default: <name>.S)
    #[arg(long)]
    asm_out: Option<PathBuf>,

    /// Also write an ELF object file
    #[arg(long)]
    obj_out: Option<PathBuf>,

    /// Target triple
    #[arg(long, default_value = "x86_64-pc-linux-gnu")]
    triple: String,

    /// Target CPU (empty for the generic CPU)
    #[arg(long, default_value = "")]
    cpu: String,

    /// Target features, e.g. +avx2,-sse4.1
    #[arg(long, default_value = "")]
    features: String,

    #[arg(long, value_enum, default_value_t = OptArg::O2)]
    opt_level: OptArg,

    #[arg(long, value_enum, default_value_t = RelocArg::Static)]
    reloc: RelocArg,

    #[arg(long, value_enum, default_value_t = CodeModelArg::Default)]
    code_model: CodeModelArg,

    /// Run the entry function after lowering
    #[arg(long)]
    run: bool,

    /// Entry function for --run
    #[arg(long, default_value = "main")]
    entry: String,

    /// Typed argument for the entry function, e.g. i32:5 or "<4 x i32>:1,2,3,4"
    #[arg(long = "arg", value_parser = parse_argument)]
    args: Vec<GenericValue>,

    #[arg(long, value_enum, default_value_t = BackendArg::Native)]
    backend: BackendArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OptArg {
    #[value(name = "0")]
    O0,
    #[value(name = "1")]
    O1,
    #[value(name = "2")]
    O2,
    #[value(name = "3")]
    O3,
}

impl From<OptArg> for OptLevel {
    fn from(arg: OptArg) -> Self {
        match arg {
            OptArg::O0 => OptLevel::None,
            OptArg::O1 => OptLevel::Less,
            OptArg::O2 => OptLevel::Default,
            OptArg::O3 => OptLevel::Aggressive,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RelocArg {
    Default,
    Static,
    Pic,
    DynamicNoPic,
}

impl From<RelocArg> for RelocModel {
    fn from(arg: RelocArg) -> Self {
        match arg {
            RelocArg::Default => RelocModel::Default,
            RelocArg::Static => RelocModel::Static,
            RelocArg::Pic => RelocModel::Pic,
            RelocArg::DynamicNoPic => RelocModel::DynamicNoPic,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CodeModelArg {
    Default,
    Small,
    Kernel,
    Medium,
    Large,
}

impl From<CodeModelArg> for CodeModel {
    fn from(arg: CodeModelArg) -> Self {
        match arg {
            CodeModelArg::Default => CodeModel::Default,
            CodeModelArg::Small => CodeModel::Small,
            CodeModelArg::Kernel => CodeModel::Kernel,
            CodeModelArg::Medium => CodeModel::Medium,
            CodeModelArg::Large => CodeModel::Large,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    /// Built-in x86-64 lowering and interpreter
    Native,
    /// LLVM code generation and MCJIT (feature `llvm`)
    Llvm,
}

/// Parse `iN:value` or `<N x iW>:v0,v1,...`.
fn parse_argument(text: &str) -> Result<GenericValue, String> {
    let (ty, value) = text
        .rsplit_once(':')
        .ok_or_else(|| format!("'{text}' is not of the form type:value"))?;
    let ty = ty.trim();
    let int_width = |ty: &str| -> Result<u32, String> {
        ty.trim()
            .strip_prefix('i')
            .and_then(|width| width.parse::<u32>().ok())
            .filter(|width| (1..=128).contains(width))
            .ok_or_else(|| format!("unsupported argument type '{ty}'"))
    };
    let int_value = |width: u32, value: &str| -> Result<GenericValue, String> {
        let value = value.trim();
        let parsed = match value.strip_prefix("0x") {
            Some(hex) => i128::from_str_radix(hex, 16),
            None => value.parse::<i128>(),
        };
        parsed
            .map(|v| GenericValue::int(width, v))
            .map_err(|e| format!("invalid integer '{value}': {e}"))
    };

    if let Some(inner) = ty.strip_prefix('<').and_then(|rest| rest.strip_suffix('>')) {
        let (count, elem) = inner
            .split_once('x')
            .ok_or_else(|| format!("malformed vector type '{ty}'"))?;
        let count: usize = count
            .trim()
            .parse()
            .map_err(|_| format!("malformed vector type '{ty}'"))?;
        let width = int_width(elem)?;
        let lanes = value
            .split(',')
            .map(|lane| int_value(width, lane))
            .collect::<Result<Vec<_>, _>>()?;
        if lanes.len() != count {
            return Err(format!("expected {count} lanes, got {}", lanes.len()));
        }
        return Ok(GenericValue::Aggregate(lanes));
    }
    int_value(int_width(ty)?, value)
}

fn write_artifact(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    fs::write(path, bytes)?;
    log::info!("wrote {}", path.display());
    Ok(())
}

impl Cli {
    fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            cpu: self.cpu.clone(),
            features: self.features.clone(),
            opt_level: self.opt_level.into(),
            reloc_model: self.reloc.into(),
            code_model: self.code_model.into(),
        }
    }

    fn artifact_stem(&self) -> String {
        match (&self.sample, &self.input) {
            (Some(sample), _) => sample.name().to_string(),
            (None, Some(input)) => input
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "out".to_string()),
            (None, None) => "out".to_string(),
        }
    }

    fn load_module(&self) -> Result<Module, Box<dyn std::error::Error>> {
        if let Some(sample) = self.sample {
            return Ok(sample.build()?);
        }
        match &self.input {
            Some(path) => Ok(parse_module(&fs::read_to_string(path)?)?),
            None => Err("either --sample or --input is required".into()),
        }
    }

    /// Write the textual IR, assembly and object artifacts.
    fn lower<L: TargetLowering>(
        &self,
        lowering: &mut L,
        verified: &VerifiedModule,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let stem = self.artifact_stem();
        let ir_path = self.ir_out.clone().unwrap_or_else(|| PathBuf::from(format!("{stem}.ll")));
        write_artifact(&ir_path, print_module(verified.module()).as_bytes())?;

        lowering.initialize_targets()?;
        log::info!("triple: {}", self.triple);
        let target = lowering.select_target(&self.triple)?;
        let machine = lowering.create_machine(&target, &self.triple, &self.machine_config())?;

        let asm = lowering.emit(&machine, verified, OutputKind::AssemblyText)?;
        let asm_path = self.asm_out.clone().unwrap_or_else(|| PathBuf::from(format!("{stem}.S")));
        write_artifact(&asm_path, &asm)?;

        if let Some(obj_path) = &self.obj_out {
            let object = lowering.emit(&machine, verified, OutputKind::ObjectBytes)?;
            write_artifact(obj_path, &object)?;
        }
        Ok(())
    }

    fn execute<B: ExecutionBackend>(
        &self,
        backend: &B,
        verified: &VerifiedModule,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let options = JitOptions {
            opt_level: self.opt_level.into(),
            ..JitOptions::default()
        };
        let mut engine = backend.create_jit(verified, &options)?;
        let result = engine.invoke(&self.entry, &self.args)?;
        println!("{result}");
        Ok(())
    }

    fn run_native(&self, module: Module) -> Result<(), Box<dyn std::error::Error>> {
        let verified = VerifiedModule::new(module, &StructuralVerifier)?;
        self.lower(&mut X64Lowering::new(), &verified)?;
        if self.run {
            self.execute(&InterpreterBackend, &verified)?;
        }
        Ok(())
    }

    #[cfg(feature = "llvm")]
    fn run_llvm(&self, module: Module) -> Result<(), Box<dyn std::error::Error>> {
        use irgen::llvm::{LlvmExecution, LlvmLowering, LlvmVerifier};

        let verified = VerifiedModule::new(module, &LlvmVerifier)?;
        self.lower(&mut LlvmLowering::new(), &verified)?;
        if self.run {
            let context = inkwell::context::Context::create();
            self.execute(&LlvmExecution::new(&context), &verified)?;
        }
        Ok(())
    }

    #[cfg(not(feature = "llvm"))]
    fn run_llvm(&self, _module: Module) -> Result<(), Box<dyn std::error::Error>> {
        Err("irgen was built without the `llvm` feature".into())
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = cli.load_module().and_then(|module| match cli.backend {
        BackendArg::Native => cli.run_native(module),
        BackendArg::Llvm => cli.run_llvm(module),
    });
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scalar_argument() {
        assert_eq!(parse_argument("i32:5"), Ok(GenericValue::from_i32(5)));
        assert_eq!(parse_argument("i8:0x7f").unwrap().as_i128(), Some(127));
        assert!(parse_argument("f32:1").is_err());
        assert!(parse_argument("5").is_err());
    }

    #[test]
    fn test_parse_vector_argument() {
        let value = parse_argument("<4 x i32>:1,2,3,4").unwrap();
        assert_eq!(value, GenericValue::vector_i32(&[1, 2, 3, 4]));
        assert!(parse_argument("<4 x i32>:1,2").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["irgen", "--sample", "c", "--run", "--arg", "<4 x i32>:1,2,3,4"])
            .unwrap();
        assert_eq!(cli.sample, Some(Sample::C));
        assert_eq!(cli.args.len(), 1);
        assert_eq!(cli.backend, BackendArg::Native);
        assert!(Cli::try_parse_from(["irgen"]).is_err());
    }
}
