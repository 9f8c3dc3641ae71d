//! Built-in operations
//!
//! Each planner maps a job onto LibreOffice, qpdf, Ghostscript, poppler-utils
//! or OCRmyPDF. Planners are pure: they only build argument lists, so intake
//! can run them to validate a request before any workspace exists.

use std::path::{Component, Path};
use std::time::Duration;

use super::types::{
    output_path, path_arg, CommandLine, ExpectedOutputs, InputKind, OperationSpec, Plan,
    PlanContext, OUTPUT_DIR,
};
use crate::error::JobError;

/// Default per-operation input limit: 100MB
const DEFAULT_MAX_INPUT_BYTES: u64 = 100 * 1024 * 1024;

/// Upper bound on parts produced by one split
const MAX_SPLIT_PARTS: usize = 100;

/// The operation table loaded at startup
pub fn builtin_operations() -> Vec<OperationSpec> {
    vec![
        OperationSpec {
            name: "to-pdf",
            description: "Convert office documents, text and images to a single PDF",
            input_kind: InputKind::Document,
            min_inputs: 1,
            max_inputs: 20,
            output_extension: "pdf",
            download_stem: "converted",
            timeout: Duration::from_secs(180),
            max_input_bytes: 50 * 1024 * 1024,
            bundle: false,
            planner: plan_to_pdf,
        },
        OperationSpec {
            name: "to-text",
            description: "Extract the text layer of a PDF",
            input_kind: InputKind::Pdf,
            min_inputs: 1,
            max_inputs: 1,
            output_extension: "txt",
            download_stem: "text",
            timeout: Duration::from_secs(60),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            bundle: false,
            planner: plan_to_text,
        },
        OperationSpec {
            name: "to-images",
            description: "Render every page to PNG or JPEG (argument: dpi)",
            input_kind: InputKind::Pdf,
            min_inputs: 1,
            max_inputs: 1,
            output_extension: "zip",
            download_stem: "pages",
            timeout: Duration::from_secs(180),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            bundle: true,
            planner: plan_to_images,
        },
        OperationSpec {
            name: "merge",
            description: "Concatenate PDFs in upload order",
            input_kind: InputKind::Pdf,
            min_inputs: 2,
            max_inputs: 50,
            output_extension: "pdf",
            download_stem: "merged",
            timeout: Duration::from_secs(60),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            bundle: false,
            planner: plan_merge,
        },
        OperationSpec {
            name: "merge-alternating",
            description: "Interleave the pages of two PDFs (A1, B1, A2, B2, ...)",
            input_kind: InputKind::Pdf,
            min_inputs: 2,
            max_inputs: 2,
            output_extension: "pdf",
            download_stem: "interleaved",
            timeout: Duration::from_secs(60),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            bundle: false,
            planner: plan_merge_alternating,
        },
        OperationSpec {
            name: "split",
            description: "Split a PDF into one file per page range (parameter: ranges)",
            input_kind: InputKind::Pdf,
            min_inputs: 1,
            max_inputs: 1,
            output_extension: "zip",
            download_stem: "split",
            timeout: Duration::from_secs(120),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            bundle: true,
            planner: plan_split,
        },
        OperationSpec {
            name: "rotate",
            description: "Rotate every page (argument: 90, 180, 270 or -90)",
            input_kind: InputKind::Pdf,
            min_inputs: 1,
            max_inputs: 1,
            output_extension: "pdf",
            download_stem: "rotated",
            timeout: Duration::from_secs(60),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            bundle: false,
            planner: plan_rotate,
        },
        OperationSpec {
            name: "reorder",
            description: "Rearrange or drop pages (parameter: order, 1-based)",
            input_kind: InputKind::Pdf,
            min_inputs: 1,
            max_inputs: 1,
            output_extension: "pdf",
            download_stem: "reordered",
            timeout: Duration::from_secs(60),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            bundle: false,
            planner: plan_reorder,
        },
        OperationSpec {
            name: "delete-pages",
            description: "Remove pages (parameter: pages, 1-based ranges)",
            input_kind: InputKind::Pdf,
            min_inputs: 1,
            max_inputs: 1,
            output_extension: "pdf",
            download_stem: "trimmed",
            timeout: Duration::from_secs(60),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            bundle: false,
            planner: plan_delete_pages,
        },
        OperationSpec {
            name: "ocr",
            description: "Add a searchable text layer with Tesseract (argument: language)",
            input_kind: InputKind::Pdf,
            min_inputs: 1,
            max_inputs: 1,
            output_extension: "pdf",
            download_stem: "ocr",
            timeout: Duration::from_secs(600),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            bundle: false,
            planner: plan_ocr,
        },
        OperationSpec {
            name: "compress",
            description: "Re-distill with Ghostscript (argument: screen, ebook, printer, prepress)",
            input_kind: InputKind::Pdf,
            min_inputs: 1,
            max_inputs: 1,
            output_extension: "pdf",
            download_stem: "compressed",
            timeout: Duration::from_secs(180),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            bundle: false,
            planner: plan_compress,
        },
        OperationSpec {
            name: "protect",
            description: "Encrypt with AES-256 and set permissions",
            input_kind: InputKind::Pdf,
            min_inputs: 1,
            max_inputs: 1,
            output_extension: "pdf",
            download_stem: "protected",
            timeout: Duration::from_secs(60),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            bundle: false,
            planner: plan_protect,
        },
        OperationSpec {
            name: "unlock",
            description: "Remove encryption given the password",
            input_kind: InputKind::Pdf,
            min_inputs: 1,
            max_inputs: 1,
            output_extension: "pdf",
            download_stem: "unlocked",
            timeout: Duration::from_secs(60),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            bundle: false,
            planner: plan_unlock,
        },
    ]
}

// ============================================================================
// Conversion
// ============================================================================

fn plan_to_pdf(ctx: &PlanContext<'_>) -> Result<Plan, JobError> {
    no_argument(ctx, "to-pdf")?;

    // Concurrent soffice processes must not share a user profile
    let profile = format!(
        "-env:UserInstallation={}",
        file_url(&ctx.workspace.join("lo-profile"))
    );

    let convert = CommandLine::new("soffice", &ctx.tools.soffice)
        .args(["--headless", "--norestore"])
        .arg(profile)
        .args(["--convert-to", "pdf", "--outdir", OUTPUT_DIR])
        .args(ctx.inputs.iter().map(|p| path_arg(p)));

    // LibreOffice names its output after the input stem
    let converted: Vec<String> = ctx
        .inputs
        .iter()
        .map(|p| {
            let stem = p.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
            path_arg(&output_path(&format!("{}.pdf", stem)))
        })
        .collect();

    if converted.len() == 1 {
        return Ok(Plan {
            steps: vec![convert],
            outputs: ExpectedOutputs::Files(vec![converted[0].clone().into()]),
        });
    }

    let merged = output_path("converted.pdf");
    let merge = CommandLine::new("qpdf", &ctx.tools.qpdf)
        .args(["--empty", "--pages"])
        .args(converted)
        .arg("--")
        .arg(path_arg(&merged));

    Ok(Plan {
        steps: vec![convert, merge],
        outputs: ExpectedOutputs::Files(vec![merged]),
    })
}

fn plan_to_text(ctx: &PlanContext<'_>) -> Result<Plan, JobError> {
    no_argument(ctx, "to-text")?;

    let out = output_path("text.txt");
    let cmd = CommandLine::new("pdftotext", &ctx.tools.pdftotext)
        .args(["-enc", "UTF-8"])
        .arg(ctx.input(0))
        .arg(path_arg(&out));

    Ok(Plan {
        steps: vec![cmd],
        outputs: ExpectedOutputs::Files(vec![out]),
    })
}

fn plan_to_images(ctx: &PlanContext<'_>) -> Result<Plan, JobError> {
    let dpi = match ctx.argument {
        None => 150,
        Some(raw) => raw
            .parse::<u32>()
            .ok()
            .filter(|dpi| (36..=600).contains(dpi))
            .ok_or_else(|| {
                JobError::InvalidInput(format!("dpi must be between 36 and 600, got '{}'", raw))
            })?,
    };

    let (flag, extension) = match ctx.param("format").unwrap_or("png").to_ascii_lowercase().as_str() {
        "png" => ("-png", "png"),
        "jpg" | "jpeg" => ("-jpeg", "jpg"),
        other => {
            return Err(JobError::InvalidInput(format!(
                "image format must be png or jpeg, got '{}'",
                other
            )))
        }
    };

    let cmd = CommandLine::new("pdftoppm", &ctx.tools.pdftoppm)
        .arg("-r")
        .arg(dpi.to_string())
        .arg(flag)
        .arg(ctx.input(0))
        .arg(path_arg(&output_path("page")));

    Ok(Plan {
        steps: vec![cmd],
        outputs: ExpectedOutputs::Matching {
            prefix: "page".to_string(),
            extension: extension.to_string(),
        },
    })
}

// ============================================================================
// Organization
// ============================================================================

fn plan_merge(ctx: &PlanContext<'_>) -> Result<Plan, JobError> {
    no_argument(ctx, "merge")?;

    let out = output_path("merged.pdf");
    let cmd = CommandLine::new("qpdf", &ctx.tools.qpdf)
        .args(["--empty", "--pages"])
        .args(ctx.inputs.iter().map(|p| path_arg(p)))
        .arg("--")
        .arg(path_arg(&out));

    Ok(Plan {
        steps: vec![cmd],
        outputs: ExpectedOutputs::Files(vec![out]),
    })
}

fn plan_merge_alternating(ctx: &PlanContext<'_>) -> Result<Plan, JobError> {
    no_argument(ctx, "merge-alternating")?;

    let out = output_path("interleaved.pdf");
    let cmd = CommandLine::new("qpdf", &ctx.tools.qpdf)
        .args(["--empty", "--collate", "--pages"])
        .arg(ctx.input(0))
        .arg(ctx.input(1))
        .arg("--")
        .arg(path_arg(&out));

    Ok(Plan {
        steps: vec![cmd],
        outputs: ExpectedOutputs::Files(vec![out]),
    })
}

fn plan_split(ctx: &PlanContext<'_>) -> Result<Plan, JobError> {
    no_argument(ctx, "split")?;

    let ranges = parse_page_ranges(ctx.require("ranges")?)?;
    if ranges.len() > MAX_SPLIT_PARTS {
        return Err(JobError::InvalidInput(format!(
            "at most {} ranges allowed, got {}",
            MAX_SPLIT_PARTS,
            ranges.len()
        )));
    }

    let mut steps = Vec::with_capacity(ranges.len());
    let mut outputs = Vec::with_capacity(ranges.len());

    for (i, range) in ranges.iter().enumerate() {
        let out = output_path(&format!("split-{}.pdf", i + 1));
        steps.push(
            CommandLine::new("qpdf", &ctx.tools.qpdf)
                .arg(ctx.input(0))
                .args(["--pages", ".", range.as_str(), "--"])
                .arg(path_arg(&out)),
        );
        outputs.push(out);
    }

    Ok(Plan {
        steps,
        outputs: ExpectedOutputs::Files(outputs),
    })
}

fn plan_rotate(ctx: &PlanContext<'_>) -> Result<Plan, JobError> {
    let degrees = match ctx.argument {
        None => 90,
        Some(raw) => match raw.parse::<i32>() {
            Ok(d @ (90 | 180 | 270 | -90)) => d,
            _ => {
                return Err(JobError::InvalidInput(format!(
                    "rotation must be 90, 180, 270 or -90, got '{}'",
                    raw
                )))
            }
        },
    };

    let out = output_path("rotated.pdf");
    let cmd = CommandLine::new("qpdf", &ctx.tools.qpdf)
        .arg(ctx.input(0))
        .arg(path_arg(&out))
        .arg(format!("--rotate={:+}", degrees));

    Ok(Plan {
        steps: vec![cmd],
        outputs: ExpectedOutputs::Files(vec![out]),
    })
}

fn plan_reorder(ctx: &PlanContext<'_>) -> Result<Plan, JobError> {
    no_argument(ctx, "reorder")?;

    let order = parse_page_ranges(ctx.require("order")?)?.join(",");

    let out = output_path("reordered.pdf");
    let cmd = CommandLine::new("qpdf", &ctx.tools.qpdf)
        .arg(ctx.input(0))
        .args(["--pages", ".", order.as_str(), "--"])
        .arg(path_arg(&out));

    Ok(Plan {
        steps: vec![cmd],
        outputs: ExpectedOutputs::Files(vec![out]),
    })
}

fn plan_delete_pages(ctx: &PlanContext<'_>) -> Result<Plan, JobError> {
    no_argument(ctx, "delete-pages")?;

    // qpdf drops pages listed after `x` from the preceding range
    let keep: String = std::iter::once("1-z".to_string())
        .chain(
            parse_page_ranges(ctx.require("pages")?)?
                .into_iter()
                .map(|range| format!("x{}", range)),
        )
        .collect::<Vec<_>>()
        .join(",");

    let out = output_path("trimmed.pdf");
    let cmd = CommandLine::new("qpdf", &ctx.tools.qpdf)
        .arg(ctx.input(0))
        .args(["--pages", ".", keep.as_str(), "--"])
        .arg(path_arg(&out));

    Ok(Plan {
        steps: vec![cmd],
        outputs: ExpectedOutputs::Files(vec![out]),
    })
}

// ============================================================================
// Optimization
// ============================================================================

fn plan_ocr(ctx: &PlanContext<'_>) -> Result<Plan, JobError> {
    let lang = ctx.argument.or_else(|| ctx.param("lang")).unwrap_or("eng");

    // Tesseract language codes, optionally combined with '+'
    let valid = !lang.is_empty()
        && lang.len() <= 64
        && lang
            .chars()
            .all(|c| c.is_ascii_lowercase() || c == '_' || c == '+');
    if !valid {
        return Err(JobError::InvalidInput(format!("invalid OCR language '{}'", lang)));
    }

    let out = output_path("ocr.pdf");
    let cmd = CommandLine::new("ocrmypdf", &ctx.tools.ocrmypdf)
        .args(["-l", lang, "--output-type", "pdfa", "--optimize", "0", "--skip-text"])
        .arg(ctx.input(0))
        .arg(path_arg(&out));

    Ok(Plan {
        steps: vec![cmd],
        outputs: ExpectedOutputs::Files(vec![out]),
    })
}

fn plan_compress(ctx: &PlanContext<'_>) -> Result<Plan, JobError> {
    let preset = ctx.argument.unwrap_or("ebook");
    if !matches!(preset, "screen" | "ebook" | "printer" | "prepress") {
        return Err(JobError::InvalidInput(format!(
            "compression preset must be screen, ebook, printer or prepress, got '{}'",
            preset
        )));
    }
    let grayscale = ctx.flag("grayscale", false)?;

    let out = output_path("compressed.pdf");
    let mut cmd = CommandLine::new("gs", &ctx.tools.gs)
        .args([
            "-sDEVICE=pdfwrite",
            "-dCompatibilityLevel=1.4",
            "-dNOPAUSE",
            "-dBATCH",
            "-dQUIET",
            "-dSAFER",
        ])
        .arg(format!("-dPDFSETTINGS=/{}", preset));

    if grayscale {
        cmd = cmd.args(["-sColorConversionStrategy=Gray", "-dProcessColorModel=/DeviceGray"]);
    }

    let cmd = cmd
        .arg(format!("-sOutputFile={}", path_arg(&out)))
        .arg(ctx.input(0));

    Ok(Plan {
        steps: vec![cmd],
        outputs: ExpectedOutputs::Files(vec![out]),
    })
}

// ============================================================================
// Security
// ============================================================================

fn plan_protect(ctx: &PlanContext<'_>) -> Result<Plan, JobError> {
    no_argument(ctx, "protect")?;

    let user = ctx.param("user_password").unwrap_or("");
    let owner = ctx.param("owner_password").unwrap_or(user);
    if owner.is_empty() {
        return Err(JobError::InvalidInput(
            "user_password or owner_password is required".to_string(),
        ));
    }

    let print = if ctx.flag("allow_print", true)? { "full" } else { "none" };
    let extract = if ctx.flag("allow_copy", true)? { "y" } else { "n" };
    let modify = if ctx.flag("allow_modify", true)? { "all" } else { "none" };

    let out = output_path("protected.pdf");
    let cmd = CommandLine::new("qpdf", &ctx.tools.qpdf)
        .args(["--encrypt", user, owner, "256"])
        .arg(format!("--print={}", print))
        .arg(format!("--extract={}", extract))
        .arg(format!("--modify={}", modify))
        .arg("--")
        .arg(ctx.input(0))
        .arg(path_arg(&out));

    Ok(Plan {
        steps: vec![cmd],
        outputs: ExpectedOutputs::Files(vec![out]),
    })
}

fn plan_unlock(ctx: &PlanContext<'_>) -> Result<Plan, JobError> {
    no_argument(ctx, "unlock")?;

    let password = ctx.require("password")?;

    let out = output_path("unlocked.pdf");
    let cmd = CommandLine::new("qpdf", &ctx.tools.qpdf)
        .arg(format!("--password={}", password))
        .arg("--decrypt")
        .arg(ctx.input(0))
        .arg(path_arg(&out));

    Ok(Plan {
        steps: vec![cmd],
        outputs: ExpectedOutputs::Files(vec![out]),
    })
}

// ============================================================================
// Helpers
// ============================================================================

fn no_argument(ctx: &PlanContext<'_>, name: &str) -> Result<(), JobError> {
    match ctx.argument {
        Some(arg) => Err(JobError::InvalidInput(format!(
            "operation '{}' takes no argument, got '{}'",
            name, arg
        ))),
        None => Ok(()),
    }
}

/// `file://` URL for an absolute path, each segment percent-encoded
fn file_url(path: &Path) -> String {
    let mut url = String::from("file://");
    for component in path.components() {
        if let Component::Normal(segment) = component {
            url.push('/');
            url.push_str(&urlencoding::encode(&segment.to_string_lossy()));
        }
    }
    url
}

/// Parse "1-3,5,9-12" into qpdf page ranges
///
/// Pages are 1-based. Ranges may be separated by ',' or ';'. Reversed ranges
/// are rejected rather than silently dropped.
pub fn parse_page_ranges(raw: &str) -> Result<Vec<String>, JobError> {
    let invalid = |part: &str| JobError::InvalidInput(format!("invalid page range '{}'", part));

    let mut ranges = Vec::new();
    for part in raw.split([',', ';']).map(str::trim).filter(|p| !p.is_empty()) {
        let range = match part.split_once('-') {
            Some((start, end)) => {
                let start: u32 = start.trim().parse().map_err(|_| invalid(part))?;
                let end: u32 = end.trim().parse().map_err(|_| invalid(part))?;
                if start == 0 || start > end {
                    return Err(invalid(part));
                }
                format!("{}-{}", start, end)
            }
            None => {
                let page: u32 = part.parse().map_err(|_| invalid(part))?;
                if page == 0 {
                    return Err(invalid(part));
                }
                page.to_string()
            }
        };
        ranges.push(range);
    }

    if ranges.is_empty() {
        return Err(JobError::InvalidInput("no page ranges given".to_string()));
    }

    Ok(ranges)
}
