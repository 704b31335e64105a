//! Markdown and JSON rendering of results

use crate::batch::BatchResult;
use crate::job::JobOutcome;
use crate::score::QualityReport;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const QUALITY_SCALE: &str = "\
## Quality Scale

| Range | Rating |
|-------|--------|
| 95+ | Excellent (visually indistinguishable) |
| 80-95 | Good (minor artifacts) |
| 60-80 | Fair (noticeable quality loss) |
| <60 | Poor (significant degradation) |
";

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Markdown summary of one comparison
pub fn render_quality_report(report: &QualityReport) -> String {
    let mut md = format!("# VMAF Quality Report: {}\n\n", report.job_id);

    md.push_str("## Score Summary\n\n| Metric | Value |\n|--------|-------|\n");
    md.push_str(&format!("| **Mean VMAF** | **{:.2}** |\n", report.vmaf.mean));
    md.push_str(&format!("| Min VMAF | {:.2} |\n", report.vmaf.min));
    md.push_str(&format!("| Max VMAF | {:.2} |\n", report.vmaf.max));
    md.push_str(&format!("| Harmonic Mean | {:.2} |\n", report.vmaf.harmonic_mean));
    if let Some(psnr) = report.psnr_y_mean {
        md.push_str(&format!("| PSNR (Y) | {psnr:.2} dB |\n"));
    }
    if let Some(ssim) = report.ssim_mean {
        md.push_str(&format!("| SSIM | {ssim:.4} |\n"));
    }
    md.push_str(&format!("| Frames | {} |\n", report.frame_count));
    md.push_str(&format!("| Model | `{}` |\n", report.model));
    md.push_str(&format!("| **Quality Rating** | **{}** |\n\n", report.rating));

    md.push_str("## Files\n\n");
    md.push_str(&format!(
        "- **Reference**: `{}` ({}x{}, {} fps, {})\n",
        file_name(&report.reference),
        report.reference_media.width,
        report.reference_media.height,
        report.reference_media.frame_rate,
        report.reference_media.pixel_format
    ));
    md.push_str(&format!(
        "- **Processed**: `{}` ({}x{}, {} fps, {})\n\n",
        file_name(&report.processed),
        report.processed_media.width,
        report.processed_media.height,
        report.processed_media.frame_rate,
        report.processed_media.pixel_format
    ));

    if !report.adjustments.is_empty() {
        md.push_str("## Adjustments\n\n");
        for adjustment in &report.adjustments {
            md.push_str(&format!("- {adjustment}\n"));
        }
        md.push('\n');
    }

    md.push_str(QUALITY_SCALE);
    md
}

/// Markdown summary table for a whole batch
pub fn render_batch_report(result: &BatchResult) -> String {
    let mut md = String::from("# VMAF Batch Report\n\n");
    md.push_str(&format!(
        "{} jobs, {} succeeded, {} failed, concurrency {}, {:.1}s\n\n",
        result.total(),
        result.succeeded,
        result.failed,
        result.concurrency_limit,
        result.elapsed_secs
    ));

    md.push_str("## Score Summary\n\n");
    md.push_str("| Job | Processed | Mean VMAF | Min | Harmonic Mean | Rating |\n");
    md.push_str("|-----|-----------|-----------|-----|---------------|--------|\n");
    for outcome in &result.outcomes {
        if let JobOutcome::Succeeded(report) = outcome {
            md.push_str(&format!(
                "| {} | `{}` | **{:.2}** | {:.2} | {:.2} | {} |\n",
                report.job_id,
                file_name(&report.processed),
                report.vmaf.mean,
                report.vmaf.min,
                report.vmaf.harmonic_mean,
                report.rating
            ));
        }
    }
    md.push('\n');

    let failures: Vec<_> = result.outcomes.iter().filter_map(JobOutcome::failure).collect();
    if !failures.is_empty() {
        md.push_str("## Failures\n\n| Job | Kind | Stage | Retryable | Message |\n");
        md.push_str("|-----|------|-------|-----------|---------|\n");
        for failure in failures {
            md.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                failure.job_id,
                failure.kind,
                failure.stage,
                if failure.retryable { "yes" } else { "no" },
                failure.message.replace('|', "\\|").replace('\n', " ")
            ));
        }
        md.push('\n');
    }

    md.push_str(QUALITY_SCALE);
    md
}

/// File name for a job's report; characters unsafe in paths become `_`.
fn report_file_name(job_id: &str) -> String {
    let stem: String = job_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    format!("{}.md", stem.trim_start_matches('.'))
}

/// Write one Markdown report per successful job into `dir` as `<job_id>.md`.
///
/// Returns the paths written, in input order.
pub fn write_job_reports(result: &BatchResult, dir: &Path) -> Result<Vec<PathBuf>, io::Error> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::new();
    for report in result.outcomes.iter().filter_map(JobOutcome::report) {
        let path = dir.join(report_file_name(&report.job_id));
        fs::write(&path, render_quality_report(report))?;
        written.push(path);
    }
    Ok(written)
}

/// Write a value as pretty JSON, creating parent directories.
pub fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<(), io::Error> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(path, json)
}

/// Write markdown text, creating parent directories.
pub fn write_markdown(markdown: &str, path: &Path) -> Result<(), io::Error> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, markdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{FailureKind, JobFailure, JobState};
    use crate::probe::{FrameRate, MediaDescriptor};
    use crate::score::{QualityRating, VmafStats};

    fn media(path: &str, width: u32, height: u32) -> MediaDescriptor {
        MediaDescriptor {
            path: PathBuf::from(path),
            container: "matroska,webm".to_string(),
            video_codec: "av1".to_string(),
            width,
            height,
            frame_rate: FrameRate::new(24000, 1001).unwrap(),
            pixel_format: "yuv420p10le".to_string(),
            duration_secs: 1320.5,
            stream_index: 0,
        }
    }

    fn report(id: &str, mean: f64) -> QualityReport {
        QualityReport {
            job_id: id.to_string(),
            reference: PathBuf::from("/masters/ep01.mov"),
            processed: PathBuf::from("/renditions/ep01_720p.mkv"),
            vmaf: VmafStats {
                mean,
                min: mean - 10.0,
                max: 100.0,
                harmonic_mean: mean - 0.5,
            },
            per_frame_vmaf: None,
            psnr_y_mean: Some(41.237),
            ssim_mean: None,
            frame_count: 31663,
            model: "vmaf_v0.6.1".to_string(),
            rating: QualityRating::from_vmaf(mean),
            adjustments: vec!["scale processed 1280x720 -> 1920x1080".to_string()],
            reference_media: media("/masters/ep01.mov", 1920, 1080),
            processed_media: media("/renditions/ep01_720p.mkv", 1280, 720),
            elapsed_secs: 812.4,
            invocations: Vec::new(),
        }
    }

    #[test]
    fn test_quality_report_markdown() {
        let md = render_quality_report(&report("ep01", 93.4567));

        assert!(md.starts_with("# VMAF Quality Report: ep01\n"));
        assert!(md.contains("| **Mean VMAF** | **93.46** |"));
        assert!(md.contains("| PSNR (Y) | 41.24 dB |"));
        assert!(!md.contains("SSIM"));
        assert!(md.contains("| **Quality Rating** | **Good** |"));
        assert!(md.contains("`ep01_720p.mkv` (1280x720, 24000/1001 fps, yuv420p10le)"));
        assert!(md.contains("- scale processed 1280x720 -> 1920x1080"));
        assert!(md.ends_with(QUALITY_SCALE));
    }

    #[test]
    fn test_batch_report_lists_successes_and_failures() {
        let result = BatchResult {
            outcomes: vec![
                JobOutcome::Succeeded(report("ep01", 97.0)),
                JobOutcome::Failed(JobFailure::new(
                    "ep02",
                    FailureKind::Timeout,
                    JobState::Scoring,
                    "ffmpeg timed out | killed",
                    true,
                )),
            ],
            succeeded: 1,
            failed: 1,
            elapsed_secs: 901.3,
            concurrency_limit: 2,
        };

        let md = render_batch_report(&result);
        assert!(md.contains("2 jobs, 1 succeeded, 1 failed, concurrency 2, 901.3s"));
        assert!(md.contains("| ep01 | `ep01_720p.mkv` | **97.00** | 87.00 | 96.50 | Excellent |"));
        assert!(md.contains("| ep02 | timeout | scoring | yes | ffmpeg timed out \\| killed (transient, may succeed on retry) |"));
    }

    #[test]
    fn test_job_reports_written_per_success() {
        let dir = tempfile::tempdir().unwrap();
        let result = BatchResult {
            outcomes: vec![
                JobOutcome::Succeeded(report("ep01", 97.0)),
                JobOutcome::Failed(JobFailure::new(
                    "ep02",
                    FailureKind::Probe,
                    JobState::Probing,
                    "missing",
                    false,
                )),
                JobOutcome::Succeeded(report("../season 2/ep03", 71.0)),
            ],
            succeeded: 2,
            failed: 1,
            elapsed_secs: 12.0,
            concurrency_limit: 1,
        };

        let written = write_job_reports(&result, &dir.path().join("jobs")).unwrap();
        assert_eq!(
            written,
            vec![
                dir.path().join("jobs/ep01.md"),
                dir.path().join("jobs/_season_2_ep03.md"),
            ]
        );
        let md = fs::read_to_string(&written[1]).unwrap();
        assert!(md.starts_with("# VMAF Quality Report: ../season 2/ep03\n"));
        assert!(md.contains("**Fair**"));
    }

    #[test]
    fn test_write_json_and_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("out/result.json");
        let md_path = dir.path().join("out/report.md");

        let r = report("ep03", 55.0);
        write_json(&r, &json_path).unwrap();
        write_markdown(&render_quality_report(&r), &md_path).unwrap();

        let back: QualityReport =
            serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(back.job_id, "ep03");
        assert_eq!(back.vmaf.mean, 55.0);
        assert_eq!(back.rating, QualityRating::Poor);
        assert!(fs::read_to_string(&md_path).unwrap().contains("**Poor**"));
    }
}
