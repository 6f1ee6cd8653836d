//! Parsers for terse (`-t`) `nmcli` output.

use std::sync::LazyLock;

use log::warn;
use regex::Regex;
use smol_str::SmolStr;

use super::split_terse;
use crate::model::{ConnectionInfo, Network, Security};

static STATE_RE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"GENERAL\.STATE:\s*activated").unwrap());
static FREQUENCY_RE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"GENERAL\.FREQUENCY:\s*(\d+)\s*MHz").unwrap());
static CHANNEL_RE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"GENERAL\.CHAN:\s*(\d+)").unwrap());
static RATE_RE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"GENERAL\.RATE:\s*([\d.]+)\s*Mb/s").unwrap());
// Terse output escapes the colons inside values.
static BSSID_RE: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r"GENERAL\.HWADDR:\s*((?:[0-9A-Fa-f]{2}\\?:){5}[0-9A-Fa-f]{2})").unwrap()
});
static MODE_RE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"802-11-wireless\.mode:\s*(\S+)").unwrap());
static KEY_MGMT_RE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"802-11-wireless-security\.key-mgmt:\s*(\S+)").unwrap());
static IP_RE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"IP4\.ADDRESS\[1\]:\s*([0-9.]+)/\d+").unwrap());
static GATEWAY_RE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"IP4\.GATEWAY:\s*([0-9.]+)").unwrap());
static DNS_RE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"IP4\.DNS\[\d+\]:\s*([0-9.]+)").unwrap());
static DEVICES_RE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"GENERAL\.DEVICES:\s*(\S+)").unwrap());

/// One row of `nmcli -t -f NAME,UUID,DEVICE connection show --active`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveConnection {
   pub name: SmolStr,
   pub uuid: SmolStr,
   pub device: SmolStr,
}

/// Classifies the SECURITY column; the first match of WPA2, WPA3, WPA, WEP wins.
pub fn classify_security(field: &str) -> Security {
   if field.contains("WPA2") {
      Security::Wpa2
   } else if field.contains("WPA3") {
      Security::Wpa3
   } else if field.contains("WPA") {
      Security::Wpa
   } else if field.contains("WEP") {
      Security::Wep
   } else {
      Security::Open
   }
}

fn classify_key_mgmt(key_mgmt: &str) -> Option<Security> {
   let key_mgmt = key_mgmt.to_ascii_lowercase();
   if key_mgmt.contains("wpa-psk") {
      Some(Security::Wpa)
   } else if key_mgmt.contains("sae") {
      Some(Security::Wpa3)
   } else if key_mgmt.contains("wep") {
      Some(Security::Wep)
   } else if key_mgmt.contains("none") {
      Some(Security::Open)
   } else {
      None
   }
}

/// Parses `nmcli -t -f SSID,SIGNAL,SECURITY,IN-USE dev wifi list`.
pub fn parse_network_list(output: &str) -> Vec<Network> {
   let mut networks = Vec::new();

   for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
      let fields = split_terse(line);
      if fields.len() < 3 {
         warn!("Skipping malformed network line: {line}");
         continue;
      }
      if fields[0].is_empty() {
         continue;
      }

      let mut network = Network::new(fields[0].as_str());
      network.signal = fields[1].trim().parse::<u8>().map_or(0, |s| s.min(100));
      network.security = classify_security(&fields[2]);
      network.in_use = fields.get(3).is_some_and(|f| f.trim() == "*");
      network.raw = line.to_string();
      networks.push(network);
   }

   networks
}

/// Parses `nmcli -t connection show <ssid>` for a saved profile.
pub fn parse_network_detail(output: &str, ssid: &str) -> Option<Network> {
   if output.trim().is_empty() {
      return None;
   }

   let capture = |re: &Regex| re.captures(output).and_then(|c| c.get(1)).map(|m| m.as_str());

   let mut network = Network::new(ssid);
   network.in_use = STATE_RE.is_match(output);
   network.frequency = capture(&FREQUENCY_RE)
      .and_then(|mhz| mhz.parse::<u32>().ok())
      .map(|mhz| (mhz as f32 / 100.0).round() / 10.0);
   network.channel = capture(&CHANNEL_RE).and_then(|c| c.parse().ok());
   network.rate = capture(&RATE_RE).map(|r| SmolStr::from(format!("{r} Mb/s")));
   network.bssid = capture(&BSSID_RE).map(|b| b.replace('\\', "").to_ascii_uppercase().into());
   network.mode = capture(&MODE_RE).map(SmolStr::from);
   if let Some(security) = capture(&KEY_MGMT_RE).and_then(classify_key_mgmt) {
      network.security = security;
   }
   network.raw = output.to_string();

   Some(network)
}

/// `nmcli radio wifi` prints `enabled` or `disabled`.
pub fn parse_radio_state(output: &str) -> bool {
   output.trim().eq_ignore_ascii_case("enabled")
}

pub fn parse_connection_info(output: &str) -> ConnectionInfo {
   let capture = |re: &Regex| {
      re.captures(output)
         .and_then(|c| c.get(1))
         .map(|m| SmolStr::from(m.as_str()))
   };

   ConnectionInfo {
      ip_address: capture(&IP_RE),
      gateway: capture(&GATEWAY_RE),
      dns_servers: DNS_RE
         .captures_iter(output)
         .filter_map(|c| c.get(1))
         .map(|m| SmolStr::from(m.as_str()))
         .collect(),
      device: capture(&DEVICES_RE),
   }
}

/// Names of saved Wi-Fi profiles from `nmcli -t -f NAME,TYPE connection show`.
pub fn parse_saved_networks(output: &str) -> Vec<SmolStr> {
   output
      .lines()
      .filter(|line| line.contains(':'))
      .filter_map(|line| {
         let fields = split_terse(line);
         (fields.len() >= 2 && fields[1].trim() == "802-11-wireless")
            .then(|| SmolStr::from(fields[0].trim()))
      })
      .collect()
}

/// Finds the active connection named `name`.
pub fn parse_active_connection(output: &str, name: &str) -> Option<ActiveConnection> {
   output.lines().find_map(|line| {
      let fields = split_terse(line);
      if fields.len() < 3 || fields[0] != name {
         return None;
      }
      Some(ActiveConnection {
         name: fields[0].as_str().into(),
         uuid: fields[1].as_str().into(),
         device: fields[2].as_str().into(),
      })
   })
}

/// First Wi-Fi interface listed by `nmcli -t -f DEVICE,TYPE device`.
pub fn parse_wifi_device(output: &str) -> Option<SmolStr> {
   output.lines().find_map(|line| {
      let fields = split_terse(line);
      match fields.as_slice() {
         [device, kind, ..] if kind.trim() == "wifi" && !device.is_empty() => {
            Some(device.as_str().into())
         },
         _ => None,
      }
   })
}

/// Received and transmitted byte totals of `iface` from `/proc/net/dev`.
pub fn parse_net_dev(contents: &str, iface: &str) -> Option<(u64, u64)> {
   contents.lines().find_map(|line| {
      let (name, counters) = line.split_once(':')?;
      if name.trim() != iface {
         return None;
      }
      let fields: Vec<&str> = counters.split_whitespace().collect();
      if fields.len() < 9 {
         warn!("Short /proc/net/dev row for {iface}");
         return None;
      }
      Some((fields[0].parse().ok()?, fields[8].parse().ok()?))
   })
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_list_line() {
      let networks = parse_network_list("HomeNet:72:WPA2:*");
      assert_eq!(networks.len(), 1);
      let net = &networks[0];
      assert_eq!(net.ssid, "HomeNet");
      assert_eq!(net.signal, 72);
      assert_eq!(net.security, Security::Wpa2);
      assert!(net.in_use);
      assert_eq!(net.raw, "HomeNet:72:WPA2:*");
   }

   #[test]
   fn test_empty_ssid_and_short_rows_dropped() {
      let networks = parse_network_list(":55:WPA2: \nshort:1\nCafe:40:: \n");
      assert_eq!(networks.len(), 1);
      assert_eq!(networks[0].ssid, "Cafe");
      assert_eq!(networks[0].security, Security::Open);
      assert!(!networks[0].in_use);
   }

   #[test]
   fn test_wpa2_wins_over_wpa3() {
      assert_eq!(classify_security("WPA2 WPA3"), Security::Wpa2);
      assert_eq!(classify_security("WPA3"), Security::Wpa3);
      assert_eq!(classify_security("WPA1"), Security::Wpa);
      assert_eq!(classify_security("WEP"), Security::Wep);
      assert_eq!(classify_security("--"), Security::Open);
      let networks = parse_network_list("Mesh:90:WPA2 WPA3:");
      assert_eq!(networks[0].security, Security::Wpa2);
   }

   #[test]
   fn test_escaped_ssid() {
      let networks = parse_network_list(r"Guest\:5G:30:WPA1:");
      assert_eq!(networks[0].ssid, "Guest:5G");
      assert_eq!(networks[0].security, Security::Wpa);
   }

   #[test]
   fn test_detail_block() {
      let output = "connection.id:HomeNet\n\
         802-11-wireless.mode:infrastructure\n\
         802-11-wireless-security.key-mgmt:sae\n\
         GENERAL.STATE:activated\n\
         GENERAL.FREQUENCY:5180 MHz\n\
         GENERAL.CHAN:36\n\
         GENERAL.RATE:866.7 Mb/s\n\
         GENERAL.HWADDR:aa\\:bb\\:cc\\:dd\\:ee\\:ff\n";
      let net = parse_network_detail(output, "HomeNet").unwrap();
      assert!(net.in_use);
      assert_eq!(net.frequency, Some(5.2));
      assert_eq!(net.channel, Some(36));
      assert_eq!(net.rate.as_deref(), Some("866.7 Mb/s"));
      assert_eq!(net.bssid.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
      assert_eq!(net.mode.as_deref(), Some("infrastructure"));
      assert_eq!(net.security, Security::Wpa3);
   }

   #[test]
   fn test_key_mgmt_mapping() {
      let wpa = parse_network_detail("802-11-wireless-security.key-mgmt:wpa-psk\n", "a").unwrap();
      assert_eq!(wpa.security, Security::Wpa);
      let open = parse_network_detail("802-11-wireless-security.key-mgmt:none\n", "a").unwrap();
      assert_eq!(open.security, Security::Open);
      let unknown = parse_network_detail("connection.id:a\n", "a").unwrap();
      assert_eq!(unknown.security, Security::Unknown);
      assert!(parse_network_detail("  ", "a").is_none());
   }

   #[test]
   fn test_connection_info() {
      let info = parse_connection_info(
         "GENERAL.DEVICES:wlan0\nIP4.ADDRESS[1]:192.168.1.20/24\nIP4.GATEWAY:192.168.1.1\nIP4.DNS[1]:1.1.1.1\nIP4.DNS[2]:9.9.9.9\n",
      );
      assert_eq!(info.ip_address.as_deref(), Some("192.168.1.20"));
      assert_eq!(info.gateway.as_deref(), Some("192.168.1.1"));
      assert_eq!(info.dns_servers, ["1.1.1.1", "9.9.9.9"]);
      assert_eq!(info.device.as_deref(), Some("wlan0"));
   }

   #[test]
   fn test_saved_and_active() {
      let saved = parse_saved_networks("HomeNet:802-11-wireless\nWired:802-3-ethernet\nlo:loopback\n");
      assert_eq!(saved, ["HomeNet"]);

      let active = "Wired:1111:eth0\nHomeNet:2222:wlan0\n";
      let conn = parse_active_connection(active, "HomeNet").unwrap();
      assert_eq!(conn.uuid, "2222");
      assert_eq!(conn.device, "wlan0");
      assert!(parse_active_connection(active, "Home").is_none());
   }

   #[test]
   fn test_radio_and_device() {
      assert!(parse_radio_state("enabled\n"));
      assert!(!parse_radio_state("disabled\n"));
      assert_eq!(parse_wifi_device("eth0:ethernet\nwlan0:wifi\n").as_deref(), Some("wlan0"));
      assert!(parse_wifi_device("eth0:ethernet\np2p-dev-wlan0:wifi-p2p\n").is_none());
      assert_eq!(
         parse_wifi_device("lo:loopback\nwlp3s0:wifi\nwlan1:wifi\n").as_deref(),
         Some("wlp3s0")
      );
   }

   #[test]
   fn test_net_dev_counters() {
      let contents = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:    9120      88    0    0    0     0          0         0     9120      88    0    0    0     0       0          0
wlan0: 73412953   61234    0    0    0     0          0         0  5123456   30211    0    0    0     0       0          0
wlan0mon:     1       1    0    0    0     0          0         0        2       1    0    0    0     0       0          0
";
      assert_eq!(parse_net_dev(contents, "wlan0"), Some((73_412_953, 5_123_456)));
      assert_eq!(parse_net_dev(contents, "wlan0mon"), Some((1, 2)));
      assert_eq!(parse_net_dev(contents, "wlan1"), None);
      assert_eq!(parse_net_dev("wlan0: 12 3\n", "wlan0"), None);
   }
}
