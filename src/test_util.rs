//! Scripted transport for exercising the poll loop without hardware.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{ErgolinkError, Result};
use crate::protocol::{self, Command};
use crate::transport::Transport;

/// One scripted outcome for a `read` call.
#[derive(Debug, Clone)]
pub enum ReadStep {
    /// Return these bytes as if the device answered.
    Frame(Vec<u8>),
    /// Fail immediately with a timeout.
    Timeout,
}

#[derive(Debug, Default)]
struct Shared {
    open_script: VecDeque<bool>,
    read_script: VecDeque<ReadStep>,
    writes: Vec<Vec<u8>>,
    opens: u32,
    closes: u32,
    open: bool,
}

/// A [`Transport`] driven by a pre-loaded script.
///
/// Open attempts succeed unless a `false` was pushed; reads consume the
/// scripted steps in order. Once the read script is exhausted, reads wait
/// out their full timeout before failing, approximating a silent device.
/// Clones share state, so a test can keep one handle for assertions while
/// the poll loop owns another.
#[derive(Debug, Clone)]
pub struct ScriptedTransport {
    shared: Arc<Mutex<Shared>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    /// Script the outcome of the next unscripted `open` call.
    pub fn push_open(&self, success: bool) {
        self.shared.lock().unwrap().open_script.push_back(success);
    }

    /// Script the outcome of the next unscripted `read` call.
    pub fn push_read(&self, step: ReadStep) {
        self.shared.lock().unwrap().read_script.push_back(step);
    }

    /// Every buffer passed to `write`, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.shared.lock().unwrap().writes.clone()
    }

    /// Number of `open` attempts so far.
    pub fn opens(&self) -> u32 {
        self.shared.lock().unwrap().opens
    }

    /// Number of `close` calls so far.
    pub fn closes(&self) -> u32 {
        self.shared.lock().unwrap().closes
    }

    pub fn is_open_now(&self) -> bool {
        self.shared.lock().unwrap().open
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&mut self) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        shared.opens += 1;
        let success = shared.open_script.pop_front().unwrap_or(true);
        if success {
            shared.open = true;
            Ok(())
        } else {
            shared.open = false;
            Err(ErgolinkError::TransportOpen("scripted failure".into()))
        }
    }

    async fn close(&mut self) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        if shared.open {
            shared.closes += 1;
            shared.open = false;
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut shared = self.shared.lock().unwrap();
        if !shared.open {
            return Err(ErgolinkError::NotOpen);
        }
        shared.writes.push(data.to_vec());
        Ok(data.len())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let step = {
            let mut shared = self.shared.lock().unwrap();
            if !shared.open {
                return Err(ErgolinkError::NotOpen);
            }
            shared.read_script.pop_front()
        };
        match step {
            Some(ReadStep::Frame(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Some(ReadStep::Timeout) => Err(ErgolinkError::Timeout),
            None => {
                // Silent device: nothing arrives for the whole deadline.
                tokio::time::sleep(timeout).await;
                Err(ErgolinkError::Timeout)
            }
        }
    }

    fn is_open(&self) -> bool {
        self.shared.lock().unwrap().open
    }
}

/// A well-formed response frame answering `GetPower` with `watts`.
pub fn power_response(watts: u16) -> Vec<u8> {
    let contents = vec![
        0x01, // Ready
        Command::GetPower.id(),
        3,
        (watts & 0xFF) as u8,
        (watts >> 8) as u8,
        protocol::unit::WATTS,
    ];
    let mut frame = vec![protocol::FLAG_START];
    frame.extend_from_slice(&protocol::stuff_contents(&contents));
    frame.push(protocol::FLAG_STOP);
    frame
}
