pub mod driver;
pub mod records;

pub use driver::{
    ConnectionType, DataType, FileEntry, IntentMap, OperationsMap, PttDriver, ReadSpec,
    ValidationReport, WriteSpec,
};
pub use records::{Device, DeviceType, DriverRecord};
