// ============================================================================
// EraseFE CLI — headless batch erase via command-line arguments
// ============================================================================
//
// Usage examples:
//   erasefe --input photo.png --marks strokes.json --output-dir out/
//   erasefe -i "shots/*.jpg" -m wm.json --output-dir clean/ --format jpeg -q 85
//   erasefe -i a.png b.png c.png -m wm.json --stage --export-dir out/
//   erasefe -i scan.png -m wm.json --engine onnx \
//           --onnx-runtime /opt/ort/libonnxruntime.so --onnx-model /opt/models/lama.onnx \
//           --output-dir out/
//
// The marks file is one stroke template in relative [0,1] coordinates; the
// same template is reapplied to every input regardless of its pixel size.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;

use crate::batch::{BatchOrchestrator, BatchOutcome, BatchRequest, Destination};
use crate::io::SaveFormat;
use crate::ops::onnx::OnnxEraseSession;
use crate::ops::patchmatch::{EraseQuality, PatchMatchSession};
use crate::session::{InferenceSession, SessionContext, SessionError, SessionFactory};
use crate::staging::StagingStore;
use crate::strokes::StrokeTemplate;

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// EraseFE headless batch eraser.
///
/// Remove a marked region from many images at once — no GUI required.
#[derive(Parser, Debug)]
#[command(
    name = "erasefe",
    about = "EraseFE headless batch object eraser",
    long_about = "Apply one saved stroke template to a batch of images and erase the\n\
                  marked region from each. Outputs PNG, JPEG, WEBP, or BMP.\n\n\
                  Example:\n  \
                  erasefe --input \"shots/*.jpg\" --marks wm.json --output-dir clean/\n  \
                  erasefe -i a.png b.png -m wm.json --stage --export-dir out/ --format jpeg"
)]
pub struct CliArgs {
    /// Input file(s). Glob patterns accepted (e.g. "*.png", "shots/*.jpg").
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<String>,

    /// Stroke template JSON file (relative [0,1] coordinates).
    #[arg(short, long, value_name = "MARKS.json")]
    pub marks: PathBuf,

    /// Output directory: each result is written as soon as it is produced.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Hold results in memory and export them all at the end (see --export-dir).
    #[arg(long)]
    pub stage: bool,

    /// Directory for the bulk export in --stage mode.
    #[arg(long, value_name = "DIR", requires = "stage")]
    pub export_dir: Option<PathBuf>,

    /// Erase engine: patchmatch (built-in, default) or onnx.
    #[arg(long, default_value = "patchmatch", value_name = "ENGINE")]
    pub engine: String,

    /// Built-in engine preset: fast, balanced, high.
    #[arg(long, default_value = "balanced", value_name = "PRESET")]
    pub preset: String,

    /// Path to the ONNX Runtime shared library (--engine onnx only).
    #[arg(long, value_name = "LIB")]
    pub onnx_runtime: Option<PathBuf>,

    /// Path to an inpainting .onnx model (--engine onnx only).
    #[arg(long, value_name = "MODEL.onnx")]
    pub onnx_model: Option<PathBuf>,

    /// Output format: png, jpeg, webp, bmp. Default png.
    #[arg(short, long, value_name = "FORMAT")]
    pub format: Option<String>,

    /// JPEG / WEBP quality (1-100, default 90).
    #[arg(short, long, default_value_t = 90, value_name = "1-100")]
    pub quality: u8,

    /// Print per-file timing information.
    #[arg(short, long)]
    pub verbose: bool,
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run the batch and return an OS exit code.
/// `0` = every item succeeded, `1` = setup failed or any item failed.
pub fn run(args: CliArgs) -> ExitCode {
    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    if args.output_dir.is_none() && !args.stage {
        eprintln!("error: choose a destination — --output-dir DIR or --stage --export-dir DIR.");
        return ExitCode::FAILURE;
    }
    if args.stage && args.export_dir.is_none() {
        eprintln!("error: --stage requires --export-dir DIR.");
        return ExitCode::FAILURE;
    }

    let template = match load_template(&args.marks) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if template.is_empty() {
        eprintln!("error: marks file '{}' contains no strokes.", args.marks.display());
        return ExitCode::FAILURE;
    }

    let format = parse_format(args.format.as_deref());
    let engine = match EngineConfig::from_args(&args) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(dir) = &args.output_dir {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "error: could not create output directory '{}': {}",
                dir.display(),
                e
            );
            return ExitCode::FAILURE;
        }
    }

    let destination = if args.stage {
        Destination::StageForExport
    } else {
        Destination::DirectDownload {
            out_dir: args.output_dir.clone().unwrap_or_else(|| PathBuf::from(".")),
            format,
            quality: args.quality,
        }
    };

    let sessions = SessionContext::new(engine.into_factory());
    let staging = StagingStore::new();
    let orchestrator = BatchOrchestrator::new(&sessions, &staging);

    let request = BatchRequest {
        inputs,
        template,
        destination,
    };

    let verbose = args.verbose;
    let batch_start = Instant::now();
    let mut item_start = Instant::now();
    let report = orchestrator.run(&request, &mut |current, total| {
        if verbose && current > 1 {
            println!("  ({:.0}ms)", item_start.elapsed().as_secs_f64() * 1000.0);
        }
        item_start = Instant::now();
        println!(
            "[{}/{}] {}",
            current,
            total,
            request_input_name(&request, current)
        );
    });

    let report = match report {
        Ok(r) => r,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    for failure in &report.failures {
        eprintln!("  error: '{}': {}", failure.name, failure.error);
    }

    // Bulk export in staging mode. PNG is the staged encoding, so only
    // re-encode when the user asked for something else.
    if args.stage {
        let export_dir = args.export_dir.as_deref().unwrap_or(Path::new("."));
        let reencode = (format != SaveFormat::Png).then_some((format, args.quality));
        match staging.export_all(export_dir, reencode) {
            Ok(n) => println!("exported {} file(s) to {}", n, export_dir.display()),
            Err(e) => {
                eprintln!("error: export failed: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    println!(
        "{} succeeded, {} failed in {:.1}s{}",
        report.successes,
        report.failures.len(),
        batch_start.elapsed().as_secs_f64(),
        if report.outcome == BatchOutcome::Cancelled {
            " (cancelled)"
        } else {
            ""
        }
    );

    if report.failures.is_empty() && report.outcome == BatchOutcome::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn request_input_name(request: &BatchRequest, current: usize) -> String {
    request
        .inputs
        .get(current - 1)
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

// ============================================================================
// Helpers
// ============================================================================

fn load_template(path: &Path) -> Result<StrokeTemplate, String> {
    let src = std::fs::read_to_string(path)
        .map_err(|e| format!("could not read marks file '{}': {}", path.display(), e))?;
    StrokeTemplate::from_json(&src)
}

/// Which erase engine to construct, fully resolved from CLI flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineConfig {
    PatchMatch { quality: EraseQuality },
    Onnx { runtime: String, model: String },
}

impl EngineConfig {
    pub fn from_args(args: &CliArgs) -> Result<Self, String> {
        match args.engine.to_lowercase().as_str() {
            "patchmatch" => {
                let quality = match args.preset.to_lowercase().as_str() {
                    "fast" => EraseQuality::Fast,
                    "high" | "highquality" => EraseQuality::HighQuality,
                    _ => EraseQuality::Balanced,
                };
                Ok(EngineConfig::PatchMatch { quality })
            }
            "onnx" => {
                let runtime = args
                    .onnx_runtime
                    .as_ref()
                    .ok_or("--engine onnx requires --onnx-runtime LIB")?
                    .to_string_lossy()
                    .into_owned();
                let model = args
                    .onnx_model
                    .as_ref()
                    .ok_or("--engine onnx requires --onnx-model MODEL.onnx")?
                    .to_string_lossy()
                    .into_owned();
                Ok(EngineConfig::Onnx { runtime, model })
            }
            other => Err(format!(
                "unknown engine '{}' (expected patchmatch or onnx)",
                other
            )),
        }
    }

    /// Turn the config into a deferred constructor. Actual construction
    /// happens inside the session context so a typo in the model path
    /// surfaces as a batch error, not a panic.
    pub fn into_factory(self) -> SessionFactory {
        match self {
            EngineConfig::PatchMatch { quality } => Box::new(move || {
                Ok(Arc::new(PatchMatchSession::new(quality)) as Arc<dyn InferenceSession>)
            }),
            EngineConfig::Onnx { runtime, model } => Box::new(move || {
                let session = OnnxEraseSession::new(&runtime, &model).map_err(SessionError::from)?;
                Ok(Arc::new(session) as Arc<dyn InferenceSession>)
            }),
        }
    }
}

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);

        if as_path.exists() {
            // Literal path — use directly
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        // Treat as glob pattern
        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{}' matched no files.", pattern);
                }
            }
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}

/// Choose the [`SaveFormat`] from the `--format` string. Defaults to PNG.
fn parse_format(format_arg: Option<&str>) -> SaveFormat {
    format_arg
        .and_then(SaveFormat::from_extension)
        .unwrap_or(SaveFormat::Png)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_paths_resolve_without_globbing() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.png");
        std::fs::write(&a, b"x").unwrap();

        let resolved = resolve_inputs(&[a.to_string_lossy().into_owned()]);
        assert_eq!(resolved, vec![a]);
    }

    #[test]
    fn glob_patterns_expand_and_dedup() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["p1.png", "p2.png"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let pattern = format!("{}/*.png", dir.path().display());
        let literal = dir.path().join("p1.png").to_string_lossy().into_owned();

        let resolved = resolve_inputs(&[literal, pattern]);
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn format_parsing_defaults_to_png() {
        assert_eq!(parse_format(None), SaveFormat::Png);
        assert_eq!(parse_format(Some("jpeg")), SaveFormat::Jpeg);
        assert_eq!(parse_format(Some("nonsense")), SaveFormat::Png);
    }

    #[test]
    fn unknown_engine_is_rejected() {
        let args = CliArgs::parse_from(["erasefe", "-i", "x.png", "-m", "m.json", "--engine", "magic"]);
        assert!(EngineConfig::from_args(&args).is_err());
    }

    #[test]
    fn onnx_engine_requires_both_paths() {
        let args = CliArgs::parse_from(["erasefe", "-i", "x.png", "-m", "m.json", "--engine", "onnx"]);
        let err = EngineConfig::from_args(&args).unwrap_err();
        assert!(err.contains("--onnx-runtime"));

        let args = CliArgs::parse_from([
            "erasefe", "-i", "x.png", "-m", "m.json", "--engine", "onnx",
            "--onnx-runtime", "/opt/ort/libonnxruntime.so",
            "--onnx-model", "/opt/models/lama.onnx",
        ]);
        assert_eq!(
            EngineConfig::from_args(&args).unwrap(),
            EngineConfig::Onnx {
                runtime: "/opt/ort/libonnxruntime.so".into(),
                model: "/opt/models/lama.onnx".into(),
            }
        );
    }
}
