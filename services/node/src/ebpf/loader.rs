//! XDP object loader.

use aya::programs::{Xdp, XdpFlags};
use aya::Ebpf;
use obsidianprotection_common::error::{Error, Result};
use obsidianprotection_ebpf::PROGRAM_NAME;
use std::path::Path;
use tracing::{info, warn};

/// Loaded filter object and its attachment state.
pub struct FilterLoader {
    ebpf: Ebpf,
    attached: Option<String>,
}

impl FilterLoader {
    /// Load the compiled XDP object from disk.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!(object = %path.display(), "Loading XDP object");

        let data = std::fs::read(path)?;
        let ebpf = Ebpf::load(&data)
            .map_err(|e| Error::internal(format!("failed to load eBPF object: {e}")))?;

        Ok(Self {
            ebpf,
            attached: None,
        })
    }

    /// Attach the filter to an interface, preferring driver mode and falling
    /// back to the generic hook.
    pub fn attach(&mut self, interface: &str) -> Result<()> {
        let program: &mut Xdp = self
            .ebpf
            .program_mut(PROGRAM_NAME)
            .ok_or_else(|| Error::internal(format!("program {PROGRAM_NAME} not in object")))?
            .try_into()
            .map_err(|e| Error::internal(format!("not an XDP program: {e}")))?;

        program
            .load()
            .map_err(|e| Error::internal(format!("failed to load XDP program: {e}")))?;

        if program.attach(interface, XdpFlags::DRV_MODE).is_err() {
            warn!(interface, "Driver mode not supported, using generic mode");
            program
                .attach(interface, XdpFlags::SKB_MODE)
                .map_err(|e| Error::internal(format!("failed to attach XDP: {e}")))?;
        }

        info!(interface, program = PROGRAM_NAME, "XDP filter attached");
        self.attached = Some(interface.to_string());
        Ok(())
    }

    pub fn attached_interface(&self) -> Option<&str> {
        self.attached.as_deref()
    }

    /// Hand out the loaded object, e.g. to take map handles.
    pub fn ebpf_mut(&mut self) -> &mut Ebpf {
        &mut self.ebpf
    }
}

impl Drop for FilterLoader {
    fn drop(&mut self) {
        // Detaching is a single atomic operation performed by the kernel when
        // the program's last reference goes away.
        if let Some(interface) = self.attached.take() {
            info!(interface, "Detaching XDP filter");
        }
    }
}
