use std::ffi::CStr;
use std::path::PathBuf;

use crate::Result;
use gdal::{cpl::CslStringList, errors::GdalError};

/// Process wide GDAL settings, applied once at startup.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub debug_logging: bool,
    pub proj_db_search_location: Option<PathBuf>,
    /// Maximum size of the GDAL block cache in bytes
    pub cache_size: Option<usize>,
}

impl Config {
    pub fn apply(&self) -> Result<()> {
        route_messages_to_log(self.debug_logging);

        if let Some(proj_db) = &self.proj_db_search_location {
            gdal::config::set_config_option("PROJ_DATA", &proj_db.to_string_lossy())?;
        }

        if let Some(cache_size) = self.cache_size {
            gdal::config::set_config_option("GDAL_CACHEMAX", &cache_size.to_string())?;
        }

        Ok(())
    }
}

/// GDAL diagnostics end up in the log facade, debug messages only when `debug` is set.
fn route_messages_to_log(debug: bool) {
    if debug && gdal::config::set_config_option("CPL_DEBUG", "ON").is_err() {
        log::debug!("Failed to enable the GDAL debug messages");
    }

    gdal::config::set_error_handler(|severity, _code, msg| {
        use gdal::errors::CplErrType;
        match severity {
            CplErrType::Debug => log::debug!("GDAL: {msg}"),
            CplErrType::Warning => log::warn!("GDAL: {msg}"),
            CplErrType::Failure | CplErrType::Fatal => log::error!("GDAL: {msg}"),
            CplErrType::None => {}
        }
    });
}

/// Raster creation and warp options in the `KEY=VALUE` list form the C api expects.
pub fn create_string_list(options: &[String]) -> Result<CslStringList> {
    let mut list = CslStringList::new();
    for option in options {
        list.add_string(option)?;
    }

    Ok(list)
}

/// Converts the return code of a GDAL call, the error carries the last GDAL error message.
pub fn check_gdal_rc(rc: gdal_sys::CPLErr::Type) -> std::result::Result<(), GdalError> {
    if rc == gdal_sys::CPLErr::CE_None {
        return Ok(());
    }

    Err(GdalError::CplError {
        class: rc,
        number: unsafe { gdal_sys::CPLGetLastErrorNo() },
        msg: last_error_message(),
    })
}

/// Fails when a GDAL call that creates an object returned a null handle.
pub fn check_gdal_pointer<T>(ptr: *mut T, method_name: &'static str) -> std::result::Result<*mut T, GdalError> {
    if !ptr.is_null() {
        return Ok(ptr);
    }

    let msg = last_error_message();
    unsafe { gdal_sys::CPLErrorReset() };
    Err(GdalError::NullPointer { method_name, msg })
}

fn last_error_message() -> String {
    let msg = unsafe { gdal_sys::CPLGetLastErrorMsg() };
    if msg.is_null() {
        return String::new();
    }

    unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
}
