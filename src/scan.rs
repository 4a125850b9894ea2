use std::{ fs::File, io::BufReader, path::{ Path, PathBuf } };

use serde::{ Deserialize, Deserializer };
use tracing::debug;

/// Display address for hosts that expose no ipv4/ipv6 address.
pub const UNKNOWN_ADDRESS: &str = "unknown";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("cannot open scan report {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode scan report {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: quick_xml::DeError,
    },
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum AddrType {
    #[default]
    Ipv4,
    Ipv6,
    Mac,
    Unsupported,
}

impl From<&str> for AddrType {
    fn from(s: &str) -> Self {
        match s {
            "ipv4" => AddrType::Ipv4,
            "ipv6" => AddrType::Ipv6,
            "mac" => AddrType::Mac,
            _ => AddrType::Unsupported,
        }
    }
}

impl AddrType {
    pub const fn as_str(self) -> &'static str {
        match self {
            AddrType::Ipv4 => "ipv4",
            AddrType::Ipv6 => "ipv6",
            AddrType::Mac => "mac",
            AddrType::Unsupported => "unsupported",
        }
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
    Ip,
    Unsupported,
}

impl From<&str> for Protocol {
    fn from(s: &str) -> Self {
        match s {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            "sctp" => Protocol::Sctp,
            "ip" => Protocol::Ip,
            _ => Protocol::Unsupported,
        }
    }
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
            Protocol::Ip => "ip",
            Protocol::Unsupported => "unsupported",
        }
    }
}

/// Port state as reported by nmap. Variant order is the order used when
/// states are listed in summaries.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug, Default)]
pub enum PortState {
    Open,
    Closed,
    Filtered,
    Unfiltered,
    OpenFiltered,
    ClosedFiltered,
    #[default]
    Unknown,
}

impl From<&str> for PortState {
    fn from(s: &str) -> Self {
        match s {
            "open" => PortState::Open,
            "closed" => PortState::Closed,
            "filtered" => PortState::Filtered,
            "unfiltered" => PortState::Unfiltered,
            "open|filtered" => PortState::OpenFiltered,
            "closed|filtered" => PortState::ClosedFiltered,
            _ => PortState::Unknown,
        }
    }
}

impl PortState {
    pub const fn as_str(self) -> &'static str {
        match self {
            PortState::Open => "open",
            PortState::Closed => "closed",
            PortState::Filtered => "filtered",
            PortState::Unfiltered => "unfiltered",
            PortState::OpenFiltered => "open|filtered",
            PortState::ClosedFiltered => "closed|filtered",
            PortState::Unknown => "unknown",
        }
    }
}

// attribute values outside the known vocabulary map to a fallback variant
// instead of failing the whole document
fn label<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where D: Deserializer<'de>, T: for<'a> From<&'a str>
{
    let s = String::deserialize(deserializer)?;
    Ok(T::from(s.as_str()))
}

#[derive(Deserialize, Debug, Default)]
pub struct ScanResult {
    #[serde(rename = "@args", default)]
    pub args: String,
    #[serde(rename = "@startstr", default)]
    pub start_str: String,
    #[serde(rename = "host", default)]
    pub hosts: Vec<Host>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct Host {
    #[serde(rename = "address", default)]
    pub addresses: Vec<Address>,
    #[serde(default, deserialize_with = "port_list")]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub os: Option<Os>,
}

impl Host {
    /// First ipv4 or ipv6 address, or [`UNKNOWN_ADDRESS`].
    pub fn address(&self) -> &str {
        self.addresses
            .iter()
            .find(|a| matches!(a.addr_type, AddrType::Ipv4 | AddrType::Ipv6))
            .map(|a| a.addr.as_str())
            .unwrap_or(UNKNOWN_ADDRESS)
    }

    pub fn os_matches(&self) -> &[OsMatch] {
        self.os.as_ref().map(|o| o.matches.as_slice()).unwrap_or_default()
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct Address {
    #[serde(rename = "@addr", default)]
    pub addr: String,
    #[serde(rename = "@addrtype", default, deserialize_with = "label")]
    pub addr_type: AddrType,
}

fn port_list<'de, D>(deserializer: D) -> Result<Vec<Port>, D::Error> where D: Deserializer<'de> {
    #[derive(Deserialize)]
    struct Ports {
        #[serde(rename = "port", default)]
        port: Vec<Port>,
    }
    Ok(Ports::deserialize(deserializer)?.port)
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct Port {
    #[serde(rename = "@protocol", default, deserialize_with = "label")]
    pub protocol: Protocol,
    #[serde(rename = "@portid", default)]
    pub port_id: u16,
    #[serde(default, deserialize_with = "state_attr")]
    pub state: PortState,
    #[serde(default)]
    pub service: Service,
}

fn state_attr<'de, D>(deserializer: D) -> Result<PortState, D::Error> where D: Deserializer<'de> {
    #[derive(Deserialize)]
    struct State {
        #[serde(rename = "@state", default, deserialize_with = "label")]
        state: PortState,
    }
    Ok(State::deserialize(deserializer)?.state)
}

/// Detected service; empty fields mean nmap could not identify them.
#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Service {
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@product", default)]
    pub product: String,
    #[serde(rename = "@version", default)]
    pub version: String,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct Os {
    #[serde(rename = "osmatch", default)]
    pub matches: Vec<OsMatch>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
pub struct OsMatch {
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@accuracy", default)]
    pub accuracy: f64,
}

pub fn parse(path: impl AsRef<Path>) -> Result<ScanResult, ParseError> {
    let path = path.as_ref();
    debug!("reading scan report {}", path.display());
    let file = File::open(path).map_err(|source| ParseError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let result: ScanResult = quick_xml::de
        ::from_reader(BufReader::new(file))
        .map_err(|source| ParseError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(hosts = result.hosts.len(), "decoded scan report");
    Ok(result)
}

#[cfg(test)]
pub(crate) mod test {
    use std::{ fs, sync::atomic::{ AtomicU64, Ordering } };

    use super::*;

    pub const TWO_HOSTS: &str =
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nmaprun>
<?xml-stylesheet href="file:///usr/bin/../share/nmap/nmap.xsl" type="text/xsl"?>
<nmaprun scanner="nmap" args="nmap -sV -O 10.0.0.0/30" start="1700000000" startstr="Tue Nov 14 22:13:20 2023" version="7.94" xmloutputversion="1.05">
  <scaninfo type="syn" protocol="tcp" numservices="1000" services="1-1000"/>
  <verbose level="0"/>
  <host starttime="1700000001" endtime="1700000009">
    <status state="up" reason="arp-response" reason_ttl="0"/>
    <address addr="10.0.0.1" addrtype="ipv4"/>
    <address addr="00:11:22:33:44:55" addrtype="mac" vendor="Acme"/>
    <hostnames><hostname name="alpha.lan" type="PTR"/></hostnames>
    <ports>
      <extraports state="closed" count="999"/>
      <port protocol="tcp" portid="22">
        <state state="open" reason="syn-ack" reason_ttl="64"/>
        <service name="ssh" product="OpenSSH" version="7.4p1" extrainfo="protocol 2.0" method="probed" conf="10"/>
      </port>
    </ports>
    <os>
      <portused state="open" proto="tcp" portid="22"/>
      <osmatch name="Linux 4.15 - 5.8" accuracy="98" line="67000"/>
      <osmatch name="Linux 5.0 - 5.4" accuracy="95" line="67100"/>
    </os>
  </host>
  <taskprogress task="Service scan" time="1700000005" percent="50.00"/>
  <host starttime="1700000001" endtime="1700000009">
    <status state="up" reason="arp-response" reason_ttl="0"/>
    <address addr="10.0.0.2" addrtype="ipv4"/>
    <ports>
      <port protocol="tcp" portid="80">
        <state state="closed" reason="reset" reason_ttl="64"/>
        <service name="http" product="Apache" version="2.4.1" method="probed" conf="10"/>
      </port>
    </ports>
  </host>
  <runstats><finished time="1700000010" elapsed="10.00"/><hosts up="2" down="2" total="4"/></runstats>
</nmaprun>
"#;

    pub fn scratch_file(name: &str, content: &str) -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(
            format!("nmap-vuln-viz-scan-test-{}-{seq}", std::process::id())
        );
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    pub fn from_str(xml: &str) -> ScanResult {
        quick_xml::de::from_str(xml).unwrap()
    }

    #[test]
    fn test_parse_two_hosts() {
        let path = scratch_file("scan.xml", TWO_HOSTS);
        let res = parse(&path).unwrap();
        assert_eq!(res.hosts.len(), 2);
        assert_eq!(res.args, "nmap -sV -O 10.0.0.0/30");
        assert_eq!(res.start_str, "Tue Nov 14 22:13:20 2023");

        let a = &res.hosts[0];
        assert_eq!(a.address(), "10.0.0.1");
        assert_eq!(a.addresses.len(), 2);
        assert_eq!(a.addresses[1].addr_type, AddrType::Mac);
        assert_eq!(a.ports.len(), 1);
        let p = &a.ports[0];
        assert_eq!(p.protocol, Protocol::Tcp);
        assert_eq!(p.port_id, 22);
        assert_eq!(p.state, PortState::Open);
        assert_eq!(p.service, Service {
            name: "ssh".to_owned(),
            product: "OpenSSH".to_owned(),
            version: "7.4p1".to_owned(),
        });
        assert_eq!(a.os_matches().len(), 2);
        assert_eq!(a.os_matches()[0].name, "Linux 4.15 - 5.8");
        assert_eq!(a.os_matches()[0].accuracy, 98.0);

        let b = &res.hosts[1];
        assert_eq!(b.address(), "10.0.0.2");
        assert_eq!(b.ports[0].state, PortState::Closed);
        assert!(b.os.is_none());
        assert!(b.os_matches().is_empty());
    }

    #[test]
    fn test_address_prefers_ip_regardless_of_order() {
        let res = from_str(
            r#"<nmaprun><host>
                <address addr="aa:bb:cc:dd:ee:ff" addrtype="mac"/>
                <address addr="192.168.1.7" addrtype="ipv4"/>
            </host><host>
                <address addr="aa:bb:cc:dd:ee:00" addrtype="mac"/>
                <address addr="fe80::1" addrtype="ipv6"/>
            </host></nmaprun>"#
        );
        assert_eq!(res.hosts[0].address(), "192.168.1.7");
        assert_eq!(res.hosts[1].address(), "fe80::1");
    }

    #[test]
    fn test_address_sentinel() {
        let res = from_str(
            r#"<nmaprun><host><address addr="aa:bb:cc:dd:ee:ff" addrtype="mac"/></host><host/></nmaprun>"#
        );
        assert_eq!(res.hosts[0].address(), UNKNOWN_ADDRESS);
        assert_eq!(res.hosts[1].address(), UNKNOWN_ADDRESS);
        assert!(!res.hosts[0].address().is_empty());
    }

    #[test]
    fn test_missing_fields_default() {
        let res = from_str(
            r#"<nmaprun><host>
                <address addr="10.1.1.1"/>
                <ports>
                  <port protocol="udp" portid="161"><state state="open|filtered"/></port>
                  <port protocol="tcp" portid="8080"><state state="filtered"/><service name="http-proxy"/></port>
                </ports>
            </host></nmaprun>"#
        );
        let h = &res.hosts[0];
        assert_eq!(h.address(), "10.1.1.1");
        assert_eq!(h.ports[0].protocol, Protocol::Udp);
        assert_eq!(h.ports[0].state, PortState::OpenFiltered);
        assert_eq!(h.ports[0].service, Service::default());
        assert_eq!(h.ports[1].service.name, "http-proxy");
        assert!(h.ports[1].service.product.is_empty());
        assert!(h.ports[1].service.version.is_empty());
    }

    #[test]
    fn test_empty_document() {
        let res = from_str("<nmaprun/>");
        assert!(res.hosts.is_empty());
    }

    #[test]
    fn test_parse_errors() {
        let missing = std::env::temp_dir().join("nmap-vuln-viz-does-not-exist.xml");
        let err = parse(&missing).unwrap_err();
        assert!(matches!(err, ParseError::Open { .. }));
        assert!(err.to_string().contains("cannot open scan report"));

        let path = scratch_file("broken.xml", "<nmaprun><host><address addr=");
        let err = parse(&path).unwrap_err();
        assert!(matches!(err, ParseError::Decode { .. }));

        let path = scratch_file(
            "badport.xml",
            r#"<nmaprun><host><ports><port protocol="tcp" portid="70000"><state state="open"/></port></ports></host></nmaprun>"#
        );
        assert!(matches!(parse(&path), Err(ParseError::Decode { .. })));
    }
}
