use std::fmt::{Debug, Formatter};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use uuid::Uuid;

/// Identity of one channel endpoint, independent of any network address it is
///  reachable by. A process keeps its channel id for its lifetime, so a
///  connection dialed back from the far side can be recognized as belonging
///  to the same logical channel even when it arrives from a different socket
///  address (NAT, multiple NICs, ephemeral ports).
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new_unique() -> ChannelId {
        ChannelId(Uuid::new_v4())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.0.as_bytes());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ChannelId> {
        Ok(ChannelId(Uuid::from_u128(buf.try_get_u128()?)))
    }
}

impl Debug for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The handshake payload. Each side of a fresh connection writes its own
///  descriptor before any envelope crosses the wire: its channel identity and
///  the addresses it is reachable by (empty for a client that accepts no
///  inbound connections - callbacks reach it over the connection it opened).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChannelDescriptor {
    pub channel_id: ChannelId,
    pub addresses: Vec<SocketAddr>,
}

impl ChannelDescriptor {
    pub fn new(channel_id: ChannelId, addresses: Vec<SocketAddr>) -> ChannelDescriptor {
        ChannelDescriptor { channel_id, addresses }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.channel_id.ser(buf);
        buf.put_usize_varint(self.addresses.len());
        for addr in &self.addresses {
            ser_socket_addr(addr, buf);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ChannelDescriptor> {
        let channel_id = ChannelId::try_deser(buf)?;
        let num_addresses = buf.try_get_usize_varint()?;
        let mut addresses = Vec::with_capacity(num_addresses.min(16));
        for _ in 0..num_addresses {
            addresses.push(try_deser_socket_addr(buf)?);
        }
        Ok(ChannelDescriptor { channel_id, addresses })
    }
}

fn ser_socket_addr(addr: &SocketAddr, buf: &mut impl BufMut) {
    match addr {
        SocketAddr::V4(data) => {
            buf.put_u8(4);
            buf.put_u32(data.ip().to_bits());
            buf.put_u16(data.port());
        }
        SocketAddr::V6(data) => {
            buf.put_u8(6);
            buf.put_u128(data.ip().to_bits());
            buf.put_u16(data.port());
        }
    }
}

fn try_deser_socket_addr(buf: &mut impl Buf) -> anyhow::Result<SocketAddr> {
    match buf.try_get_u8()? {
        4 => {
            let ip = buf.try_get_u32()?;
            let port = buf.try_get_u16()?;
            Ok(SocketAddr::V4(SocketAddrV4::new(ip.into(), port)))
        }
        6 => {
            let ip = buf.try_get_u128()?;
            let port = buf.try_get_u16()?;
            Ok(SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0)))
        }
        n => Err(anyhow!("invalid socket address discriminator: {}", n)),
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::no_addresses(vec![])]
    #[case::v4(vec!["1.2.3.4:5678"])]
    #[case::v6(vec!["[2001:db8::1]:443"])]
    #[case::mixed(vec!["127.0.0.1:9000", "[::1]:9000"])]
    fn test_descriptor_round_trip(#[case] addresses: Vec<&str>) {
        let descriptor = ChannelDescriptor::new(
            ChannelId::new_unique(),
            addresses.iter().map(|a| SocketAddr::from_str(a).unwrap()).collect(),
        );

        let mut buf = BytesMut::new();
        descriptor.ser(&mut buf);
        assert_eq!(ChannelDescriptor::try_deser(&mut buf.as_ref()).unwrap(), descriptor);
    }

    #[rstest]
    fn test_descriptor_truncated() {
        let descriptor = ChannelDescriptor::new(
            ChannelId::new_unique(),
            vec![SocketAddr::from_str("1.2.3.4:5678").unwrap()],
        );
        let mut buf = BytesMut::new();
        descriptor.ser(&mut buf);

        let truncated = &buf.as_ref()[..buf.len() - 1];
        assert!(ChannelDescriptor::try_deser(&mut &truncated[..]).is_err());
    }

    #[rstest]
    fn test_invalid_address_discriminator() {
        let mut buf = BytesMut::new();
        ChannelId::new_unique().ser(&mut buf);
        buf.put_u8(1); // one address
        buf.put_u8(9); // neither 4 nor 6

        assert!(ChannelDescriptor::try_deser(&mut buf.as_ref()).is_err());
    }
}
