//! Model catalog.
//!
//! Static tables mapping Apple model numbers (`A2084`) and the 16-bit product
//! identifiers seen in modalias / advertisements (`0x2014`) to a [`Model`],
//! plus the capabilities derived from it.

use serde::{Deserialize, Serialize};

/// Known `AirPods` models.
#[derive(
   Debug,
   Default,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumIter,
)]
pub enum Model {
   #[default]
   #[strum(to_string = "Unknown AirPods")]
   Unknown,
   #[strum(to_string = "AirPods 1st Gen")]
   AirPods1,
   #[strum(to_string = "AirPods 2nd Gen")]
   AirPods2,
   #[strum(to_string = "AirPods 3rd Gen")]
   AirPods3,
   #[strum(to_string = "AirPods 4th Gen")]
   AirPods4,
   #[strum(to_string = "AirPods 4th Gen (ANC)")]
   AirPods4Anc,
   #[strum(to_string = "AirPods Pro")]
   Pro,
   #[strum(to_string = "AirPods Pro 2")]
   Pro2,
   #[strum(to_string = "AirPods Pro 2 (USB-C)")]
   Pro2UsbC,
   #[strum(to_string = "AirPods Pro 3")]
   Pro3,
   #[strum(to_string = "AirPods Max")]
   Max,
   #[strum(to_string = "AirPods Max (USB-C)")]
   MaxUsbC,
}

/// Feature flags derived from a [`Model`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
   pub supports_anc: bool,
   pub supports_adaptive: bool,
   pub is_headphones: bool,
}

/// Model numbers printed on the hardware, one entry per SKU.
const MODEL_NUMBERS: &[(&str, Model)] = &[
   ("A1523", Model::AirPods1),
   ("A1722", Model::AirPods1),
   ("A2032", Model::AirPods2),
   ("A2031", Model::AirPods2),
   ("A2565", Model::AirPods3),
   ("A2564", Model::AirPods3),
   ("A3053", Model::AirPods4),
   ("A3050", Model::AirPods4),
   ("A3054", Model::AirPods4),
   ("A3056", Model::AirPods4Anc),
   ("A3055", Model::AirPods4Anc),
   ("A3057", Model::AirPods4Anc),
   ("A2084", Model::Pro),
   ("A2083", Model::Pro),
   ("A2931", Model::Pro2),
   ("A2699", Model::Pro2),
   ("A2698", Model::Pro2),
   ("A3047", Model::Pro2UsbC),
   ("A3048", Model::Pro2UsbC),
   ("A3049", Model::Pro2UsbC),
   ("A3064", Model::Pro3),
   ("A3065", Model::Pro3),
   ("A3063", Model::Pro3),
   ("A2096", Model::Max),
   ("A3184", Model::MaxUsbC),
];

/// Product identifiers as reported in the Bluetooth modalias.
const PRODUCT_IDS: &[(u16, Model)] = &[
   (0x2002, Model::AirPods1),
   (0x200F, Model::AirPods2),
   (0x2013, Model::AirPods3),
   (0x2019, Model::AirPods4),
   (0x201B, Model::AirPods4Anc),
   (0x200E, Model::Pro),
   (0x2014, Model::Pro2),
   (0x2024, Model::Pro2UsbC),
   (0x200A, Model::Max),
   (0x201F, Model::MaxUsbC),
];

impl Model {
   /// Looks up a model number such as `A2084`. Unknown numbers map to
   /// [`Model::Unknown`].
   pub fn from_number(number: &str) -> Self {
      let number = number.trim();
      MODEL_NUMBERS
         .iter()
         .find(|(n, _)| n.eq_ignore_ascii_case(number))
         .map_or(Self::Unknown, |&(_, model)| model)
   }

   /// Looks up a 16-bit product identifier.
   pub fn from_product_id(pid: u16) -> Self {
      PRODUCT_IDS
         .iter()
         .find(|(p, _)| *p == pid)
         .map_or(Self::Unknown, |&(_, model)| model)
   }

   /// Whether any known product advertises `low_byte` as the low byte of its
   /// identifier (the form carried in proximity-pairing advertisements).
   pub fn is_known_pid_byte(low_byte: u8) -> bool {
      PRODUCT_IDS.iter().any(|(pid, _)| (pid & 0xff) as u8 == low_byte)
   }

   pub fn display_name(self) -> String {
      self.to_string()
   }

   pub const fn is_known(self) -> bool {
      !matches!(self, Self::Unknown)
   }

   pub const fn capabilities(self) -> Capabilities {
      use Model::*;
      Capabilities {
         supports_anc: matches!(self, Pro | Pro2 | Pro2UsbC | Pro3 | Max | MaxUsbC | AirPods4Anc),
         supports_adaptive: matches!(self, Pro2 | Pro2UsbC | Pro3 | AirPods4Anc),
         is_headphones: matches!(self, Max | MaxUsbC),
      }
   }
}

#[cfg(test)]
mod tests {
   use strum::IntoEnumIterator;

   use super::*;

   #[test]
   fn test_from_number() {
      assert_eq!(Model::from_number("A2032"), Model::AirPods2);
      assert_eq!(Model::from_number("a2084"), Model::Pro);
      assert_eq!(Model::from_number("A3048"), Model::Pro2UsbC);
      assert_eq!(Model::from_number("A3184"), Model::MaxUsbC);
      assert_eq!(Model::from_number("A9999"), Model::Unknown);
      assert_eq!(Model::from_number(""), Model::Unknown);
   }

   #[test]
   fn test_from_product_id() {
      assert_eq!(Model::from_product_id(0x2014), Model::Pro2);
      assert_eq!(Model::from_product_id(0x200A), Model::Max);
      assert_eq!(Model::from_product_id(0x1234), Model::Unknown);
      assert!(!PRODUCT_IDS.iter().any(|&(_, m)| m == Model::Pro3));
      assert!(Model::is_known_pid_byte(0x14));
      assert!(!Model::is_known_pid_byte(0x99));
   }

   #[test]
   fn test_every_model_number_is_known() {
      for (number, model) in MODEL_NUMBERS {
         assert!(model.is_known(), "{number}");
         assert_eq!(Model::from_number(number), *model);
      }
   }

   #[test]
   fn test_capabilities() {
      let caps = Model::Pro2.capabilities();
      assert!(caps.supports_anc && caps.supports_adaptive && !caps.is_headphones);

      let caps = Model::Max.capabilities();
      assert!(caps.supports_anc && !caps.supports_adaptive && caps.is_headphones);

      let caps = Model::AirPods2.capabilities();
      assert_eq!(caps, Capabilities::default());

      assert!(Model::AirPods4Anc.capabilities().supports_adaptive);
      assert!(!Model::AirPods4.capabilities().supports_anc);
      assert_eq!(Model::Unknown.capabilities(), Capabilities::default());
   }

   #[test]
   fn test_display_names() {
      assert_eq!(Model::AirPods2.display_name(), "AirPods 2nd Gen");
      assert_eq!(Model::Pro2UsbC.display_name(), "AirPods Pro 2 (USB-C)");
      assert_eq!(Model::Unknown.display_name(), "Unknown AirPods");
      let names: Vec<_> = Model::iter().map(Model::display_name).collect();
      assert_eq!(names.len(), 12);
      assert!(names.iter().all(|n| n.starts_with("AirPods") || n == "Unknown AirPods"));
   }
}
