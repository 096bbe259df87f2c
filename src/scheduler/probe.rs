use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{AfrunError, Result};

/// Reports how much memory is currently free on a device.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    /// Free memory of `device` in MB.
    async fn free_memory_mb(&self, device: u32) -> Result<u64>;
}

/// Queries `nvidia-smi` for one GPU's free memory.
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    program: String,
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self {
            program: "nvidia-smi".to_string(),
        }
    }
}

impl NvidiaSmiProbe {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn parse_free_memory(stdout: &str) -> Option<u64> {
        stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .and_then(|l| l.parse().ok())
    }
}

#[async_trait]
impl DeviceProbe for NvidiaSmiProbe {
    async fn free_memory_mb(&self, device: u32) -> Result<u64> {
        let index = device.to_string();
        let output = Command::new(&self.program)
            .args([
                "--query-gpu=memory.free",
                "--format=csv,noheader,nounits",
                "-i",
                index.as_str(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| AfrunError::DeviceQuery(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(AfrunError::DeviceQuery(format!(
                "{} exited with {:?}: {}",
                self.program,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Self::parse_free_memory(&stdout).ok_or_else(|| {
            AfrunError::DeviceQuery(format!(
                "unexpected {} output for device {}: {:?}",
                self.program, device, stdout
            ))
        })
    }
}

/// Reports the same free memory for every device.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe {
    free_mb: u64,
}

impl StaticProbe {
    pub fn new(free_mb: u64) -> Self {
        Self { free_mb }
    }

    /// A probe under which every device is always fit.
    pub fn unlimited() -> Self {
        Self::new(u64::MAX)
    }
}

#[async_trait]
impl DeviceProbe for StaticProbe {
    async fn free_memory_mb(&self, _device: u32) -> Result<u64> {
        Ok(self.free_mb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_non_empty_line() {
        assert_eq!(NvidiaSmiProbe::parse_free_memory("\n 81037 \n"), Some(81037));
        assert_eq!(NvidiaSmiProbe::parse_free_memory("N/A"), None);
        assert_eq!(NvidiaSmiProbe::parse_free_memory(""), None);
    }

    #[tokio::test]
    async fn missing_program_is_a_device_query_error() {
        let probe = NvidiaSmiProbe::with_program("nonexistent_smi_12345");
        let err = probe.free_memory_mb(0).await.unwrap_err();
        assert!(matches!(err, AfrunError::DeviceQuery(_)));
    }

    #[tokio::test]
    async fn failing_or_garbled_query_is_a_device_query_error() {
        let failing = NvidiaSmiProbe::with_program("false");
        assert!(matches!(
            failing.free_memory_mb(0).await,
            Err(AfrunError::DeviceQuery(_))
        ));

        // echo prints its arguments, which do not parse as a number
        let garbled = NvidiaSmiProbe::with_program("echo");
        assert!(matches!(
            garbled.free_memory_mb(0).await,
            Err(AfrunError::DeviceQuery(_))
        ));
    }

    #[tokio::test]
    async fn static_probe_reports_fixed_amount() {
        assert_eq!(StaticProbe::new(42).free_memory_mb(7).await.unwrap(), 42);
    }
}
