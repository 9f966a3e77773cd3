use bytes::{BufMut, BytesMut};
use hearth_core::error::{Error, Result};
use std::net::Ipv4Addr;

/// DHCP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DhcpMessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl DhcpMessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Discover),
            2 => Some(Self::Offer),
            3 => Some(Self::Request),
            4 => Some(Self::Decline),
            5 => Some(Self::Ack),
            6 => Some(Self::Nak),
            7 => Some(Self::Release),
            8 => Some(Self::Inform),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        }
    }
}

impl std::fmt::Display for DhcpMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// DHCP option codes
pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_DNS_SERVER: u8 = 6;
pub const OPT_HOSTNAME: u8 = 12;
pub const OPT_DOMAIN_NAME: u8 = 15;
pub const OPT_REQUESTED_IP: u8 = 50;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MESSAGE_TYPE: u8 = 53;
pub const OPT_SERVER_ID: u8 = 54;
pub const OPT_RENEWAL_TIME: u8 = 58;
pub const OPT_REBINDING_TIME: u8 = 59;
pub const OPT_CLIENT_ID: u8 = 61;
pub const OPT_END: u8 = 255;

/// Magic cookie for DHCP options
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

/// BOOTP fixed header plus parsed options.
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,    // 1=BOOTREQUEST, 2=BOOTREPLY
    pub htype: u8, // Hardware type (1=Ethernet)
    pub hlen: u8,  // Hardware address length (6 for MAC)
    pub hops: u8,
    pub xid: u32, // Transaction ID
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr, // Client IP
    pub yiaddr: Ipv4Addr, // 'Your' IP (offered/assigned)
    pub siaddr: Ipv4Addr, // Server IP
    pub giaddr: Ipv4Addr, // Gateway/relay IP
    pub chaddr: [u8; 16], // Client hardware address
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Vec<DhcpOption>,
}

#[derive(Debug, Clone)]
pub struct DhcpOption {
    pub code: u8,
    pub data: Vec<u8>,
}

impl DhcpPacket {
    /// Parse a frame. Anything below the 240-byte BOOTP minimum or without
    /// the options magic cookie is rejected.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 240 {
            return Err(Error::Codec(format!("packet too short: {} bytes", data.len())));
        }

        let op = data[0];
        let htype = data[1];
        let hlen = data[2];
        let hops = data[3];
        let xid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let secs = u16::from_be_bytes([data[8], data[9]]);
        let flags = u16::from_be_bytes([data[10], data[11]]);
        let ciaddr = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let yiaddr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
        let siaddr = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let giaddr = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);

        let mut sname = [0u8; 64];
        sname.copy_from_slice(&data[44..108]);

        let mut file = [0u8; 128];
        file.copy_from_slice(&data[108..236]);

        if data[236..240] != MAGIC_COOKIE {
            return Err(Error::Codec("missing magic cookie".to_string()));
        }

        let options = parse_options(&data[240..]);

        Ok(DhcpPacket {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options,
        })
    }

    /// Serialize, terminating the option block and padding to the 300-byte
    /// classic BOOTP minimum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(300);

        buf.put_u8(self.op);
        buf.put_u8(self.htype);
        buf.put_u8(self.hlen);
        buf.put_u8(self.hops);
        buf.put_u32(self.xid);
        buf.put_u16(self.secs);
        buf.put_u16(self.flags);
        buf.put_slice(&self.ciaddr.octets());
        buf.put_slice(&self.yiaddr.octets());
        buf.put_slice(&self.siaddr.octets());
        buf.put_slice(&self.giaddr.octets());
        buf.put_slice(&self.chaddr);
        buf.put_slice(&self.sname);
        buf.put_slice(&self.file);
        buf.put_slice(&MAGIC_COOKIE);

        for opt in &self.options {
            buf.put_u8(opt.code);
            if opt.code != OPT_END {
                buf.put_u8(opt.data.len() as u8);
                buf.put_slice(&opt.data);
            }
        }

        if self.options.last().map(|o| o.code) != Some(OPT_END) {
            buf.put_u8(OPT_END);
        }

        while buf.len() < 300 {
            buf.put_u8(0);
        }

        buf.to_vec()
    }

    pub fn message_type(&self) -> Option<DhcpMessageType> {
        self.get_option(OPT_MESSAGE_TYPE)
            .and_then(|data| data.first().copied())
            .and_then(DhcpMessageType::from_u8)
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.get_option(OPT_REQUESTED_IP).and_then(|data| {
            if data.len() == 4 {
                Some(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
            } else {
                None
            }
        })
    }

    pub fn hostname(&self) -> Option<String> {
        self.get_option(OPT_HOSTNAME)
            .and_then(|data| String::from_utf8(data.to_vec()).ok())
    }

    /// Opaque client identifier (option 61) as lowercase hex.
    pub fn client_id(&self) -> Option<String> {
        self.get_option(OPT_CLIENT_ID).map(|data| {
            data.iter().map(|b| format!("{b:02x}")).collect::<String>()
        })
    }

    pub fn get_option(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|o| o.code == code)
            .map(|o| o.data.as_slice())
    }

    /// Colon-separated lowercase MAC taken from chaddr.
    pub fn mac_address(&self) -> String {
        let len = (self.hlen as usize).min(6);
        self.chaddr[..len]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

fn parse_options(data: &[u8]) -> Vec<DhcpOption> {
    let mut options = Vec::new();
    let mut i = 0;

    while i < data.len() {
        let code = data[i];
        i += 1;

        if code == OPT_END {
            break;
        }

        if code == 0 {
            // Pad option
            continue;
        }

        if i >= data.len() {
            break;
        }

        let len = data[i] as usize;
        i += 1;

        if i + len > data.len() {
            break;
        }

        options.push(DhcpOption {
            code,
            data: data[i..i + len].to_vec(),
        });
        i += len;
    }

    options
}

/// Build a DHCP option carrying one IPv4 address.
pub fn ip_option(code: u8, addr: Ipv4Addr) -> DhcpOption {
    DhcpOption {
        code,
        data: addr.octets().to_vec(),
    }
}

/// Build a DHCP option carrying a big-endian u32 (lease time, timers).
pub fn u32_option(code: u8, val: u32) -> DhcpOption {
    DhcpOption {
        code,
        data: val.to_be_bytes().to_vec(),
    }
}

/// Build a DHCP option carrying a list of IPv4 addresses.
pub fn ip_list_option(code: u8, addrs: &[Ipv4Addr]) -> DhcpOption {
    let mut data = Vec::new();
    for addr in addrs {
        data.extend_from_slice(&addr.octets());
    }
    DhcpOption { code, data }
}

/// Build a DHCP option carrying a string value.
pub fn string_option(code: u8, s: &str) -> DhcpOption {
    DhcpOption {
        code,
        data: s.as_bytes().to_vec(),
    }
}

pub fn message_type_option(msg_type: DhcpMessageType) -> DhcpOption {
    DhcpOption {
        code: OPT_MESSAGE_TYPE,
        data: vec![msg_type as u8],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_packet() -> DhcpPacket {
        DhcpPacket {
            op: 1,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid: 0x12345678,
            secs: 0,
            flags: 0x8000,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: {
                let mut c = [0u8; 16];
                c[0..6].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
                c
            },
            sname: [0u8; 64],
            file: [0u8; 128],
            options: vec![
                message_type_option(DhcpMessageType::Discover),
                string_option(OPT_HOSTNAME, "laptop"),
                DhcpOption {
                    code: OPT_CLIENT_ID,
                    data: vec![0x01, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
                },
            ],
        }
    }

    #[test]
    fn test_roundtrip() {
        let packet = request_packet();
        let bytes = packet.to_bytes();
        assert!(bytes.len() >= 300);

        let parsed = DhcpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.op, 1);
        assert_eq!(parsed.xid, 0x12345678);
        assert_eq!(parsed.flags, 0x8000);
        assert_eq!(parsed.message_type(), Some(DhcpMessageType::Discover));
        assert_eq!(parsed.mac_address(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(parsed.hostname().as_deref(), Some("laptop"));
        assert_eq!(parsed.client_id().as_deref(), Some("01aabbccddeeff"));
    }

    #[test]
    fn test_requested_ip_option() {
        let mut packet = request_packet();
        packet
            .options
            .push(ip_option(OPT_REQUESTED_IP, "192.168.1.100".parse().unwrap()));

        let parsed = DhcpPacket::parse(&packet.to_bytes()).unwrap();
        assert_eq!(
            parsed.requested_ip(),
            Some("192.168.1.100".parse().unwrap())
        );
    }

    #[test]
    fn test_rejects_short_packet() {
        let err = DhcpPacket::parse(&[0u8; 239]).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn test_rejects_bad_cookie() {
        let packet = request_packet();
        let mut bytes = packet.to_bytes();
        bytes[236] = 0;
        assert!(DhcpPacket::parse(&bytes).is_err());
    }

    #[test]
    fn test_options_survive_padding() {
        let packet = request_packet();
        let mut bytes = packet.to_bytes();
        // Trailing zero padding must not be parsed as options
        bytes.extend_from_slice(&[0u8; 64]);
        let parsed = DhcpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.message_type(), Some(DhcpMessageType::Discover));
    }

    #[test]
    fn test_unknown_message_type() {
        assert_eq!(DhcpMessageType::from_u8(0), None);
        assert_eq!(DhcpMessageType::from_u8(9), None);
        assert_eq!(DhcpMessageType::from_u8(5), Some(DhcpMessageType::Ack));
    }
}
