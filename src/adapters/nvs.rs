//! NVS (Non-Volatile Storage) adapter for the control configuration.
//!
//! Persists [`ControlConfig`] as a single postcard blob. Fields the
//! controller calibrates at runtime (the collapse-recovery threshold) are
//! saved too, so one recovery per install suffices rather than one per
//! boot. The host backend is an in-memory map for tests.

use log::info;

use crate::app::ports::ConfigPort;
use crate::config::ControlConfig;

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

const CONFIG_NAMESPACE: &str = "suntrack";
const CONFIG_KEY: &str = "ctlcfg";

#[allow(dead_code)]
const MAX_BLOB_SIZE: usize = 512;

pub struct NvsAdapter {
    #[cfg(not(target_os = "espidf"))]
    store: std::collections::HashMap<String, Vec<u8>>,
}

impl NvsAdapter {
    /// Initialise NVS flash (device) or the in-memory store (host). On
    /// first boot or a version mismatch the flash partition is erased and
    /// re-initialised.
    pub fn new() -> anyhow::Result<Self> {
        #[cfg(target_os = "espidf")]
        {
            // SAFETY: nvs_flash_init / nvs_flash_erase run from the single
            // main-task context before any other NVS access.
            let ret = unsafe { nvs_flash_init() };
            if ret == ESP_ERR_NVS_NO_FREE_PAGES || ret == ESP_ERR_NVS_NEW_VERSION_FOUND {
                log::warn!("nvs: erasing and re-initialising flash partition");
                let ret = unsafe { nvs_flash_erase() };
                anyhow::ensure!(ret == ESP_OK, "nvs erase failed (rc={ret})");
                let ret = unsafe { nvs_flash_init() };
                anyhow::ensure!(ret == ESP_OK, "nvs re-init failed (rc={ret})");
            } else {
                anyhow::ensure!(ret == ESP_OK, "nvs init failed (rc={ret})");
            }
            info!("nvs: flash initialised");
        }

        #[cfg(not(target_os = "espidf"))]
        info!("nvs: in-memory backend");

        Ok(Self {
            #[cfg(not(target_os = "espidf"))]
            store: std::collections::HashMap::new(),
        })
    }

    /// Open an NVS namespace, run a closure with the handle, then close.
    #[cfg(target_os = "espidf")]
    fn with_nvs_handle<F, T>(write: bool, f: F) -> Result<T, i32>
    where
        F: FnOnce(nvs_handle_t) -> Result<T, i32>,
    {
        let mut ns_buf = [0u8; 16];
        let ns = CONFIG_NAMESPACE.as_bytes();
        ns_buf[..ns.len()].copy_from_slice(ns);

        let mode = if write {
            nvs_open_mode_t_NVS_READWRITE
        } else {
            nvs_open_mode_t_NVS_READONLY
        };
        let mut handle: nvs_handle_t = 0;
        // SAFETY: namespace buffer is NUL-terminated by construction.
        let ret = unsafe { nvs_open(ns_buf.as_ptr() as *const _, mode, &mut handle) };
        if ret != ESP_OK {
            return Err(ret);
        }
        let result = f(handle);
        unsafe {
            nvs_close(handle);
        }
        result
    }
}

impl ConfigPort for NvsAdapter {
    fn load(&mut self) -> anyhow::Result<Option<ControlConfig>> {
        #[cfg(not(target_os = "espidf"))]
        {
            let Some(bytes) = self.store.get(CONFIG_KEY) else {
                info!("nvs: no stored config");
                return Ok(None);
            };
            let cfg: ControlConfig = postcard::from_bytes(bytes)
                .map_err(|e| anyhow::anyhow!("stored config corrupted: {e}"))?;
            cfg.validate()
                .map_err(|e| anyhow::anyhow!("stored config invalid: {e}"))?;
            Ok(Some(cfg))
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_nvs_handle(false, |handle| {
                let key = b"ctlcfg\0";
                let mut size: usize = 0;
                let ret = unsafe {
                    nvs_get_blob(
                        handle,
                        key.as_ptr() as *const _,
                        core::ptr::null_mut(),
                        &mut size,
                    )
                };
                if ret != ESP_OK || size == 0 || size > MAX_BLOB_SIZE {
                    return Err(ret);
                }
                let mut buf = vec![0u8; size];
                let ret = unsafe {
                    nvs_get_blob(
                        handle,
                        key.as_ptr() as *const _,
                        buf.as_mut_ptr() as *mut _,
                        &mut size,
                    )
                };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(buf)
            });
            match result {
                Ok(bytes) => {
                    let cfg: ControlConfig = postcard::from_bytes(&bytes)
                        .map_err(|e| anyhow::anyhow!("stored config corrupted: {e}"))?;
                    cfg.validate()
                        .map_err(|e| anyhow::anyhow!("stored config invalid: {e}"))?;
                    info!("nvs: loaded config ({} bytes)", bytes.len());
                    Ok(Some(cfg))
                }
                Err(e) if e == ESP_ERR_NVS_NOT_FOUND => {
                    info!("nvs: no stored config");
                    Ok(None)
                }
                Err(e) => {
                    log::warn!("nvs: read error {e}, falling back to defaults");
                    Ok(None)
                }
            }
        }
    }

    fn save(&mut self, config: &ControlConfig) -> anyhow::Result<()> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("refusing to persist invalid config: {e}"))?;
        let bytes = postcard::to_allocvec(config)?;

        #[cfg(not(target_os = "espidf"))]
        {
            self.store.insert(CONFIG_KEY.to_owned(), bytes);
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_nvs_handle(true, |handle| {
                let key = b"ctlcfg\0";
                let ret = unsafe {
                    nvs_set_blob(
                        handle,
                        key.as_ptr() as *const _,
                        bytes.as_ptr() as *const _,
                        bytes.len(),
                    )
                };
                if ret != ESP_OK {
                    return Err(ret);
                }
                let ret = unsafe { nvs_commit(handle) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(())
            });
            match result {
                Ok(()) => {
                    info!("nvs: config saved ({} bytes)", bytes.len());
                    Ok(())
                }
                Err(e) => anyhow::bail!("nvs write error (rc={e})"),
            }
        }
    }
}
