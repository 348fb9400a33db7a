//! Network layer messages (Clause 6.4).

use bytes::{BufMut, Bytes, BytesMut};

use super::{NetworkError, Result};
use crate::generate_custom_enum;
use crate::util::Buffer;

/// Network layer message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NetworkMessageType {
    WhoIsRouterToNetwork = 0x00,
    IAmRouterToNetwork = 0x01,
    ICouldBeRouterToNetwork = 0x02,
    RejectMessageToNetwork = 0x03,
    RouterBusyToNetwork = 0x04,
    RouterAvailableToNetwork = 0x05,
    InitializeRoutingTable = 0x06,
    InitializeRoutingTableAck = 0x07,
    EstablishConnectionToNetwork = 0x08,
    DisconnectConnectionToNetwork = 0x09,
    WhatIsNetworkNumber = 0x12,
    NetworkNumberIs = 0x13,
}

impl TryFrom<u8> for NetworkMessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::WhoIsRouterToNetwork),
            0x01 => Ok(Self::IAmRouterToNetwork),
            0x02 => Ok(Self::ICouldBeRouterToNetwork),
            0x03 => Ok(Self::RejectMessageToNetwork),
            0x04 => Ok(Self::RouterBusyToNetwork),
            0x05 => Ok(Self::RouterAvailableToNetwork),
            0x06 => Ok(Self::InitializeRoutingTable),
            0x07 => Ok(Self::InitializeRoutingTableAck),
            0x08 => Ok(Self::EstablishConnectionToNetwork),
            0x09 => Ok(Self::DisconnectConnectionToNetwork),
            0x12 => Ok(Self::WhatIsNetworkNumber),
            0x13 => Ok(Self::NetworkNumberIs),
            other => Err(other),
        }
    }
}

generate_custom_enum! {
    /// Reason carried by Reject-Message-To-Network
    RejectMessageReason {
        Other = 0,
        NotDirectlyConnected = 1,
        RouterBusy = 2,
        UnknownMessageType = 3,
        MessageTooLong = 4,
        SecurityError = 5,
        AddressingError = 6,
    },
    u8,
    128..=255
}

/// One port of an Initialize-Routing-Table(-Ack) message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTablePort {
    pub network: u16,
    /// 0 asks the receiver to purge the entry
    pub port_id: u8,
    pub info: Bytes,
}

/// Network layer message carried in an NPDU with the network-message flag set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    /// `None` asks about every network
    WhoIsRouterToNetwork(Option<u16>),
    IAmRouterToNetwork(Vec<u16>),
    ICouldBeRouterToNetwork {
        network: u16,
        performance_index: u8,
    },
    RejectMessageToNetwork {
        reason: RejectMessageReason,
        network: u16,
    },
    RouterBusyToNetwork(Vec<u16>),
    RouterAvailableToNetwork(Vec<u16>),
    InitializeRoutingTable(Vec<RoutingTablePort>),
    InitializeRoutingTableAck(Vec<RoutingTablePort>),
    EstablishConnectionToNetwork {
        network: u16,
        termination_time: u8,
    },
    DisconnectConnectionToNetwork(u16),
    WhatIsNetworkNumber,
    NetworkNumberIs {
        network: u16,
        configured: bool,
    },
    /// Reserved ASHRAE message type below 0x80
    Other { message_type: u8, data: Bytes },
    Proprietary {
        message_type: u8,
        vendor_id: u16,
        data: Bytes,
    },
}

fn encode_networks(buffer: &mut BytesMut, networks: &[u16]) {
    for network in networks {
        buffer.put_u16(*network);
    }
}

fn encode_ports(buffer: &mut BytesMut, ports: &[RoutingTablePort]) {
    buffer.put_u8(ports.len().min(u8::MAX as usize) as u8);
    for port in ports.iter().take(u8::MAX as usize) {
        let info = &port.info[..port.info.len().min(u8::MAX as usize)];
        buffer.put_u16(port.network);
        buffer.put_u8(port.port_id);
        buffer.put_u8(info.len() as u8);
        buffer.put_slice(info);
    }
}

fn malformed(message_type: u8) -> NetworkError {
    NetworkError::Malformed(format!("network message 0x{:02X} payload", message_type))
}

fn decode_networks(message_type: u8, data: &[u8]) -> Result<Vec<u16>> {
    if data.len() % 2 != 0 {
        return Err(malformed(message_type));
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

fn decode_ports(message_type: u8, data: &Bytes) -> Result<Vec<RoutingTablePort>> {
    let mut buffer = Buffer::new(data);
    let count = buffer.read_u8().ok_or_else(|| malformed(message_type))?;
    let mut ports = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let network = buffer.read_u16().ok_or_else(|| malformed(message_type))?;
        let port_id = buffer.read_u8().ok_or_else(|| malformed(message_type))?;
        let length = buffer.read_u8().ok_or_else(|| malformed(message_type))? as usize;
        let start = buffer.position();
        if !buffer.skip(length) {
            return Err(malformed(message_type));
        }
        ports.push(RoutingTablePort {
            network,
            port_id,
            info: data.slice(start..start + length),
        });
    }
    Ok(ports)
}

impl NetworkMessage {
    pub fn message_type(&self) -> u8 {
        let known = match self {
            NetworkMessage::WhoIsRouterToNetwork(_) => NetworkMessageType::WhoIsRouterToNetwork,
            NetworkMessage::IAmRouterToNetwork(_) => NetworkMessageType::IAmRouterToNetwork,
            NetworkMessage::ICouldBeRouterToNetwork { .. } => {
                NetworkMessageType::ICouldBeRouterToNetwork
            }
            NetworkMessage::RejectMessageToNetwork { .. } => {
                NetworkMessageType::RejectMessageToNetwork
            }
            NetworkMessage::RouterBusyToNetwork(_) => NetworkMessageType::RouterBusyToNetwork,
            NetworkMessage::RouterAvailableToNetwork(_) => {
                NetworkMessageType::RouterAvailableToNetwork
            }
            NetworkMessage::InitializeRoutingTable(_) => NetworkMessageType::InitializeRoutingTable,
            NetworkMessage::InitializeRoutingTableAck(_) => {
                NetworkMessageType::InitializeRoutingTableAck
            }
            NetworkMessage::EstablishConnectionToNetwork { .. } => {
                NetworkMessageType::EstablishConnectionToNetwork
            }
            NetworkMessage::DisconnectConnectionToNetwork(_) => {
                NetworkMessageType::DisconnectConnectionToNetwork
            }
            NetworkMessage::WhatIsNetworkNumber => NetworkMessageType::WhatIsNetworkNumber,
            NetworkMessage::NetworkNumberIs { .. } => NetworkMessageType::NetworkNumberIs,
            NetworkMessage::Other { message_type, .. }
            | NetworkMessage::Proprietary { message_type, .. } => return *message_type,
        };
        known as u8
    }

    /// Message type, vendor ID when proprietary, then the payload
    pub fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u8(self.message_type());
        match self {
            NetworkMessage::WhoIsRouterToNetwork(network) => {
                if let Some(network) = network {
                    buffer.put_u16(*network);
                }
            }
            NetworkMessage::IAmRouterToNetwork(networks)
            | NetworkMessage::RouterBusyToNetwork(networks)
            | NetworkMessage::RouterAvailableToNetwork(networks) => {
                encode_networks(buffer, networks)
            }
            NetworkMessage::ICouldBeRouterToNetwork {
                network,
                performance_index,
            } => {
                buffer.put_u16(*network);
                buffer.put_u8(*performance_index);
            }
            NetworkMessage::RejectMessageToNetwork { reason, network } => {
                buffer.put_u8(u8::from(*reason));
                buffer.put_u16(*network);
            }
            NetworkMessage::InitializeRoutingTable(ports)
            | NetworkMessage::InitializeRoutingTableAck(ports) => encode_ports(buffer, ports),
            NetworkMessage::EstablishConnectionToNetwork {
                network,
                termination_time,
            } => {
                buffer.put_u16(*network);
                buffer.put_u8(*termination_time);
            }
            NetworkMessage::DisconnectConnectionToNetwork(network) => buffer.put_u16(*network),
            NetworkMessage::WhatIsNetworkNumber => {}
            NetworkMessage::NetworkNumberIs {
                network,
                configured,
            } => {
                buffer.put_u16(*network);
                buffer.put_u8(u8::from(*configured));
            }
            NetworkMessage::Other { data, .. } => buffer.put_slice(data),
            NetworkMessage::Proprietary {
                vendor_id, data, ..
            } => {
                buffer.put_u16(*vendor_id);
                buffer.put_slice(data);
            }
        }
    }

    /// Decode the payload that follows the message type (and vendor ID)
    pub fn decode(message_type: u8, vendor_id: Option<u16>, data: &Bytes) -> Result<Self> {
        if message_type >= 0x80 {
            let vendor_id = vendor_id.ok_or_else(|| malformed(message_type))?;
            return Ok(NetworkMessage::Proprietary {
                message_type,
                vendor_id,
                data: data.clone(),
            });
        }

        let kind = match NetworkMessageType::try_from(message_type) {
            Ok(kind) => kind,
            Err(_) => {
                return Ok(NetworkMessage::Other {
                    message_type,
                    data: data.clone(),
                })
            }
        };

        let mut buffer = Buffer::new(data);
        let message = match kind {
            NetworkMessageType::WhoIsRouterToNetwork => match data.len() {
                0 => NetworkMessage::WhoIsRouterToNetwork(None),
                _ => NetworkMessage::WhoIsRouterToNetwork(Some(
                    buffer.read_u16().ok_or_else(|| malformed(message_type))?,
                )),
            },
            NetworkMessageType::IAmRouterToNetwork => {
                NetworkMessage::IAmRouterToNetwork(decode_networks(message_type, data)?)
            }
            NetworkMessageType::RouterBusyToNetwork => {
                NetworkMessage::RouterBusyToNetwork(decode_networks(message_type, data)?)
            }
            NetworkMessageType::RouterAvailableToNetwork => {
                NetworkMessage::RouterAvailableToNetwork(decode_networks(message_type, data)?)
            }
            NetworkMessageType::ICouldBeRouterToNetwork => {
                let network = buffer.read_u16().ok_or_else(|| malformed(message_type))?;
                let performance_index = buffer.read_u8().ok_or_else(|| malformed(message_type))?;
                NetworkMessage::ICouldBeRouterToNetwork {
                    network,
                    performance_index,
                }
            }
            NetworkMessageType::RejectMessageToNetwork => {
                let reason = buffer.read_u8().ok_or_else(|| malformed(message_type))?;
                let network = buffer.read_u16().ok_or_else(|| malformed(message_type))?;
                NetworkMessage::RejectMessageToNetwork {
                    reason: RejectMessageReason::from(reason),
                    network,
                }
            }
            NetworkMessageType::InitializeRoutingTable => {
                NetworkMessage::InitializeRoutingTable(decode_ports(message_type, data)?)
            }
            NetworkMessageType::InitializeRoutingTableAck => {
                NetworkMessage::InitializeRoutingTableAck(decode_ports(message_type, data)?)
            }
            NetworkMessageType::EstablishConnectionToNetwork => {
                let network = buffer.read_u16().ok_or_else(|| malformed(message_type))?;
                let termination_time = buffer.read_u8().ok_or_else(|| malformed(message_type))?;
                NetworkMessage::EstablishConnectionToNetwork {
                    network,
                    termination_time,
                }
            }
            NetworkMessageType::DisconnectConnectionToNetwork => {
                NetworkMessage::DisconnectConnectionToNetwork(
                    buffer.read_u16().ok_or_else(|| malformed(message_type))?,
                )
            }
            NetworkMessageType::WhatIsNetworkNumber => NetworkMessage::WhatIsNetworkNumber,
            NetworkMessageType::NetworkNumberIs => {
                let network = buffer.read_u16().ok_or_else(|| malformed(message_type))?;
                let flag = buffer.read_u8().ok_or_else(|| malformed(message_type))?;
                NetworkMessage::NetworkNumberIs {
                    network,
                    configured: flag == 1,
                }
            }
        };
        Ok(message)
    }
}
