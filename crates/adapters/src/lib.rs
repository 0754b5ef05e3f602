pub mod mysql;
pub mod secrets;
pub mod ssh;

use sqlpane_core::driver::Driver;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unsupported driver `{0}`")]
pub struct UnsupportedDriver(pub String);

/// Driver for a configured `driverName`. Qt-style names such as `QMYSQL`
/// are accepted alongside `mysql` and `mariadb`.
pub fn create_driver(driver_name: &str) -> Result<Box<dyn Driver>, UnsupportedDriver> {
    match driver_name.trim().to_ascii_lowercase().as_str() {
        "mysql" | "mariadb" | "qmysql" | "qmysql3" => Ok(Box::new(mysql::MysqlDriver::new())),
        _ => Err(UnsupportedDriver(driver_name.to_string())),
    }
}
