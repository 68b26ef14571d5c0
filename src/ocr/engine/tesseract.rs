use anyhow::{Context, Result, anyhow};
use std::path::Path;
use std::process::Command;

pub fn list_tesseract_languages(command: &str) -> Result<Vec<String>> {
    let output = Command::new(command)
        .arg("--list-langs")
        .output()
        .with_context(|| format!("failed to run {} --list-langs", command))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("{} --list-langs failed: {}", command, stderr.trim()));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|lang| !lang.is_empty())
        .map(str::to_string)
        .collect())
}

/// Keeps the requested languages the installed engine knows, joined with `+`.
pub(super) fn normalize_ocr_languages(command: &str, requested: &str) -> Result<String> {
    let trimmed = requested.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("ocr languages is empty"));
    }

    let available = match list_tesseract_languages(command) {
        Ok(list) => list,
        Err(err) => {
            tracing::debug!("cannot list OCR languages, using them as given: {:#}", err);
            return Ok(trimmed.split([',', ' ']).filter(|l| !l.is_empty()).collect::<Vec<_>>().join("+"));
        }
    };

    let (chosen, missing): (Vec<&str>, Vec<&str>) = trimmed
        .split(['+', ',', ' '])
        .map(str::trim)
        .filter(|lang| !lang.is_empty())
        .partition(|lang| available.iter().any(|value| value == lang));

    if chosen.is_empty() {
        return Err(anyhow!(
            "ocr language(s) not available: {} (available: {})",
            missing.join(", "),
            available.join(", ")
        ));
    }
    if !missing.is_empty() {
        tracing::warn!(
            "ocr language(s) not available: {} (available: {})",
            missing.join(", "),
            available.join(", ")
        );
    }
    Ok(chosen.join("+"))
}

pub(super) fn run_tesseract_tsv(
    command: &str,
    path: &Path,
    languages: &str,
    psm: u32,
) -> Result<String> {
    let output = Command::new(command)
        .arg(path)
        .arg("stdout")
        .arg("-l")
        .arg(languages)
        .arg("--psm")
        .arg(psm.to_string())
        .arg("tsv")
        .output()
        .with_context(|| format!("failed to run {} (is it installed?)", command))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("{} failed: {}", command, stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
