//! GPU memory queries for the resource metric

use log::debug;
use std::process::Command;

/// Used memory in MiB of every visible GPU, as reported by `nvidia-smi`.
/// Empty when the tool is missing or fails.
pub fn gpu_memory_used_mb() -> Vec<f64> {
    let output = match Command::new("nvidia-smi")
        .args(["--query-gpu=memory.used", "--format=csv,noheader,nounits"])
        .output()
    {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            debug!("nvidia-smi exited with {}", output.status);
            return Vec::new();
        }
        Err(e) => {
            debug!("nvidia-smi unavailable: {}", e);
            return Vec::new();
        }
    };
    parse_memory_used(&String::from_utf8_lossy(&output.stdout))
}

fn parse_memory_used(text: &str) -> Vec<f64> {
    text.lines()
        .filter_map(|line| line.trim().parse::<f64>().ok())
        .collect()
}
