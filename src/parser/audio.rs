//! Parser for `pactl list sinks short` and `pactl list sources short`.

use log::warn;

use crate::model::AudioEndpoint;

/// Backend-name fragment of endpoints provided by a Bluetooth audio profile.
const WIRELESS_MARKER: &str = "bluez";

pub fn is_wireless_name(name: &str) -> bool {
   name.to_ascii_lowercase().contains(WIRELESS_MARKER)
}

/// Parses short-form rows: `<id> <name> <driver> <sample spec> <state>`.
pub fn parse_endpoints(output: &str) -> Vec<AudioEndpoint> {
   let mut endpoints = Vec::new();

   for line in output.lines() {
      let parts: Vec<&str> = line.split_whitespace().collect();
      if parts.len() < 2 {
         continue;
      }

      let Ok(id) = parts[0].parse::<u32>() else {
         warn!("Skipping malformed audio endpoint line: {line}");
         continue;
      };
      let name = parts[1];
      let description = if parts.len() > 2 {
         parts[2..].join(" ")
      } else {
         name.to_string()
      };

      endpoints.push(AudioEndpoint {
         id,
         name: name.into(),
         description,
         wireless: is_wireless_name(name),
      });
   }

   endpoints
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_short_listing() {
      let output = "\
50\talsa_output.pci-0000_00_1f.3.analog-stereo\tPipeWire\ts32le 2ch 48000Hz\tSUSPENDED
73\tbluez_output.AA_BB_CC_DD_EE_FF.1\tPipeWire\ts16le 2ch 48000Hz\tRUNNING
";
      let sinks = parse_endpoints(output);
      assert_eq!(sinks.len(), 2);
      assert_eq!(sinks[0].id, 50);
      assert!(!sinks[0].wireless);
      assert_eq!(sinks[1].name, "bluez_output.AA_BB_CC_DD_EE_FF.1");
      assert!(sinks[1].wireless);
      assert_eq!(sinks[1].description, "PipeWire s16le 2ch 48000Hz RUNNING");
   }

   #[test]
   fn test_malformed_rows_skipped() {
      let sinks = parse_endpoints("x\nnot-a-number sink\n7 BlueZ_Sink\n");
      assert_eq!(sinks.len(), 1);
      assert_eq!(sinks[0].description, "BlueZ_Sink");
      assert!(sinks[0].wireless);
   }
}
