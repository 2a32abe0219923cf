//! Runtime concerns shared by thinglink hosts: logging and layered settings.

mod logger;
mod settings;

pub use logger::{parse_level, Logger};
pub use settings::{DeviceSection, General, Inner as SettingsInner, Settings, ENV_PREFIX};
