//! Device Information Service reads (diagnostic only)

use crate::domain::models::DeviceInfo;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol::device_info::{
    MANUFACTURER_NAME, MODEL_NUMBER, SERIAL_NUMBER, SOFTWARE_REVISION,
};
use crate::infrastructure::bluetooth::transport::Link;

pub async fn read_device_info(link: &Link<'_>) -> Result<DeviceInfo, TransportError> {
    let manufacturer = link.read(MANUFACTURER_NAME).await?;
    let model = link.read(MODEL_NUMBER).await?;
    let serial = link.read(SERIAL_NUMBER).await?;
    let software = link.read(SOFTWARE_REVISION).await?;

    Ok(DeviceInfo {
        manufacturer: DeviceInfo::decode_field(&manufacturer),
        model: DeviceInfo::decode_field(&model),
        serial: DeviceInfo::decode_field(&serial),
        software: DeviceInfo::decode_field(&software),
    })
}
