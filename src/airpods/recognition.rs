//! Device recognition for `AirPods` accessories.
//!
//! Discovery only sees generic `BlueZ` devices; the checks here decide which
//! of them speak the accessory protocol, from the most to the least reliable
//! signal: modalias, manufacturer data, service UUIDs, name/alias.

use log::debug;
use uuid::Uuid;

use crate::airpods::model::Model;

/// Patterns to match `AirPods` devices (case-insensitive)
const AIRPOD_PATTERNS: &[&str] = &["airpods"];

/// Apple vendor ID (Bluetooth SIG company id used in modalias)
const APPLE_VID: u32 = 0x004C;

/// Apple company ID for manufacturer data
const APPLE_CID: u16 = 0x004C;

/// Proximity-pairing message type in manufacturer data
const PP_TYPE: u8 = 0x07;

/// Offset of the product-id byte inside the manufacturer data TLV
const PID_OFFSET: usize = 6;

/// Apple service UUIDs; not always advertised
static APPLE_SERVICES: [Uuid; 3] = [
   Uuid::from_u128(0x0000fd6f_0000_1000_8000_00805f9b34fb),
   Uuid::from_u128(0x0000fd39_0000_1000_8000_00805f9b34fb),
   Uuid::from_u128(0x0000fd32_0000_1000_8000_00805f9b34fb),
];

/// Resolves a modalias vendor/product pair to a known model.
pub fn model_from_modalias(vendor: u32, product: u32) -> Option<Model> {
   if vendor != APPLE_VID {
      return None;
   }
   let model = Model::from_product_id(u16::try_from(product).ok()?);
   model.is_known().then_some(model)
}

/// Checks an Apple proximity-pairing payload for a known product id.
pub fn check_manufacturer_data(data: &[u8]) -> bool {
   // [0] type, [1] len, [2..5] status, [6] product id, ...
   data.len() > PID_OFFSET && data[0] == PP_TYPE && Model::is_known_pid_byte(data[PID_OFFSET])
}

pub fn matches_name(name: &str) -> bool {
   let name = name.to_ascii_lowercase();
   AIRPOD_PATTERNS.iter().any(|p| name.contains(p))
}

pub fn has_apple_service(uuids: impl IntoIterator<Item = Uuid>) -> bool {
   uuids.into_iter().any(|u| APPLE_SERVICES.contains(&u))
}

pub async fn is_device_airpods(dev: &bluer::Device) -> bool {
   let addr = dev.address();

   if let Ok(Some(modalias)) = dev.modalias().await
      && let Some(model) = model_from_modalias(modalias.vendor, modalias.product)
   {
      debug!("{addr}: recognized {model} via modalias {:#06x}", modalias.product);
      return true;
   }

   if let Ok(Some(mfg_data)) = dev.manufacturer_data().await
      && let Some(apple_data) = mfg_data.get(&APPLE_CID)
      && check_manufacturer_data(apple_data)
   {
      debug!("{addr}: recognized via manufacturer data");
      return true;
   }

   if let Ok(Some(uuids)) = dev.uuids().await
      && has_apple_service(uuids)
   {
      debug!("{addr}: recognized via Apple service UUID");
      return true;
   }

   if let Ok(Some(name)) = dev.name().await
      && matches_name(&name)
   {
      debug!("{addr}: recognized via name {name:?}");
      return true;
   }
   if let Ok(alias) = dev.alias().await
      && matches_name(&alias)
   {
      debug!("{addr}: recognized via alias {alias:?}");
      return true;
   }
   false
}
