//! Wire framing and the request/response body types for every message the runtime speaks.
//!
//! Every message is `header || body`. The header is hand-encoded (8-byte LE type tag,
//! 8-byte LE request index, 1-byte is-request flag) rather than left to `serde`/`bincode`'s
//! own enum tagging, because the header's byte layout is fixed independent of whatever body
//! follows it. Bodies are ordinary `serde`-derived structs encoded with `bincode`'s default
//! little-endian, length-prefixed representation, which already handles variable-length
//! strings and vectors without any hand-rolled encoder.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use jani_macros::WireMessage;

use crate::config::LayerId;
use crate::entity::EntityId;
use crate::mask::{ComponentId, ComponentMask};
use crate::query::ComponentQuery;
use crate::error::WireError;

pub const HEADER_LEN: usize = 8 + 8 + 1;

/// The literal datagram a channel sends in place of user traffic once it's been idle past
/// `HEARTBEAT_INTERVAL`. First byte (`0x04`) never collides with the `KIND_*` tags
/// `transport::channel` uses for data/fragment/ack framing, so a receiver tells it apart by
/// byte content rather than a separate framing tag. Interpreted entirely at the transport
/// level; a `MessageType` body never carries these bytes.
pub const HEARTBEAT_PAYLOAD: [u8; 5] = [0x04, 0x1C, 0x24, 0x13, 0x6F];

/// Every request/response type the core speaks, across all four peer kinds (worker, runtime,
/// spawner, inspector). Discriminants are the `u64` wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum MessageType {
    // Worker -> Runtime
    RuntimeAuthentication = 1,
    RuntimeClientAuthentication = 2,
    RuntimeLogMessage = 3,
    RuntimeReserveEntityIdRange = 4,
    RuntimeAddEntity = 5,
    RuntimeRemoveEntity = 6,
    RuntimeAddComponent = 7,
    RuntimeRemoveComponent = 8,
    RuntimeComponentUpdate = 9,
    RuntimeComponentInterestQueryUpdate = 10,
    RuntimeWorkerReportAcknowledge = 11,
    // Runtime -> Worker
    WorkerAddComponent = 12,
    WorkerRemoveComponent = 13,
    WorkerLayerAuthorityGain = 14,
    WorkerLayerAuthorityLost = 15,
    // Inspector <-> Runtime
    RuntimeGetEntitiesInfo = 16,
    RuntimeGetCellsInfos = 17,
    RuntimeGetWorkersInfos = 18,
    RuntimeInspectorQuery = 19,
    // Runtime -> Worker, interest-query fan-out
    RuntimeComponentInterestQueryResult = 20,
    // Runtime <-> Spawner
    SpawnWorkerForLayer = 21,
}

impl MessageType {
    pub fn to_u64(self) -> u64 {
        self as u64
    }

    pub fn from_u64(v: u64) -> Option<Self> {
        use MessageType::*;
        Some(match v {
            1 => RuntimeAuthentication,
            2 => RuntimeClientAuthentication,
            3 => RuntimeLogMessage,
            4 => RuntimeReserveEntityIdRange,
            5 => RuntimeAddEntity,
            6 => RuntimeRemoveEntity,
            7 => RuntimeAddComponent,
            8 => RuntimeRemoveComponent,
            9 => RuntimeComponentUpdate,
            10 => RuntimeComponentInterestQueryUpdate,
            11 => RuntimeWorkerReportAcknowledge,
            12 => WorkerAddComponent,
            13 => WorkerRemoveComponent,
            14 => WorkerLayerAuthorityGain,
            15 => WorkerLayerAuthorityLost,
            16 => RuntimeGetEntitiesInfo,
            17 => RuntimeGetCellsInfos,
            18 => RuntimeGetWorkersInfos,
            19 => RuntimeInspectorQuery,
            20 => RuntimeComponentInterestQueryResult,
            21 => SpawnWorkerForLayer,
            _ => return None,
        })
    }
}

/// Implemented (via `#[derive(WireMessage)]`) by every body type, tying it to its
/// [`MessageType`] tag so `encode_message`/`decode_message` don't need a match arm per type.
pub trait WireMessage {
    const TYPE: MessageType;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub request_index: u64,
    pub is_request: bool,
}

pub fn encode_header(buf: &mut Vec<u8>, header: &MessageHeader) {
    buf.extend_from_slice(&header.message_type.to_u64().to_le_bytes());
    buf.extend_from_slice(&header.request_index.to_le_bytes());
    buf.push(header.is_request as u8);
}

pub fn decode_header(bytes: &[u8]) -> Result<(MessageHeader, &[u8]), WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::Truncated(bytes.len(), HEADER_LEN));
    }
    let type_tag = u64::from_le_bytes(bytes[0..8].try_into().expect("slice is exactly 8 bytes"));
    let request_index = u64::from_le_bytes(bytes[8..16].try_into().expect("slice is exactly 8 bytes"));
    let is_request = bytes[16] != 0;
    let message_type = MessageType::from_u64(type_tag).ok_or(WireError::UnknownType(type_tag))?;
    Ok((
        MessageHeader { message_type, request_index, is_request },
        &bytes[HEADER_LEN..],
    ))
}

/// Encodes `header` followed by `body`'s `bincode` representation.
pub fn encode_message<T: Serialize>(header: &MessageHeader, body: &T) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    encode_header(&mut buf, header);
    let body_bytes = bincode::serialize(body)?;
    buf.extend_from_slice(&body_bytes);
    Ok(buf)
}

/// Convenience wrapper that fills in `header.message_type` from `T::TYPE`.
pub fn encode<T: Serialize + WireMessage>(request_index: u64, is_request: bool, body: &T) -> Result<Vec<u8>, WireError> {
    encode_message(
        &MessageHeader { message_type: T::TYPE, request_index, is_request },
        body,
    )
}

pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<(MessageHeader, T), WireError> {
    let (header, rest) = decode_header(bytes)?;
    let body = bincode::deserialize(rest)?;
    Ok((header, body))
}

/// Splits `items` into chunks whose accumulated `item_size` stays under `budget`: the
/// interest-query engine and inspector query handlers split when accumulated byte size
/// exceeds 500 bytes. Never splits a single item -- one larger than the budget on its own is
/// returned alone in its own chunk.
pub fn chunk_by_budget<T>(items: Vec<T>, item_size: impl Fn(&T) -> usize, budget: usize) -> Vec<Vec<T>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_size = 0usize;
    for item in items {
        let size = item_size(&item);
        if !current.is_empty() && current_size + size > budget {
            chunks.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += size;
        current.push(item);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Specialization of [`chunk_by_budget`] for `(ComponentId, Vec<u8>)` payload lists.
pub fn chunk_components(components: Vec<(ComponentId, Vec<u8>)>, budget: usize) -> Vec<Vec<(ComponentId, Vec<u8>)>> {
    chunk_by_budget(components, |(_, payload)| payload.len() + 1, budget)
}

// ---------------------------------------------------------------------------------------
// Worker -> Runtime
// ---------------------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeAuthentication)]
pub struct RuntimeAuthentication {
    pub layer_id: LayerId,
    pub client_hash: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeAuthentication)]
pub struct RuntimeAuthenticationResponse {
    pub succeed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeClientAuthentication)]
pub struct RuntimeClientAuthentication {
    pub layer_id: LayerId,
    pub client_hash: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeClientAuthentication)]
pub struct RuntimeClientAuthenticationResponse {
    pub succeed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeLogMessage)]
pub struct RuntimeLogMessage {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeReserveEntityIdRange)]
pub struct RuntimeReserveEntityIdRange {
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeReserveEntityIdRange)]
pub struct RuntimeReserveEntityIdRangeResponse {
    pub succeed: bool,
    pub begin: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeAddEntity)]
pub struct RuntimeAddEntity {
    pub entity_id: EntityId,
    pub components: Vec<(ComponentId, Vec<u8>)>,
    pub position: (i32, i32),
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeAddEntity)]
pub struct RuntimeAddEntityResponse {
    pub succeed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeRemoveEntity)]
pub struct RuntimeRemoveEntity {
    pub entity_id: EntityId,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeRemoveEntity)]
pub struct RuntimeRemoveEntityResponse {
    pub succeed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeAddComponent)]
pub struct RuntimeAddComponent {
    pub entity_id: EntityId,
    pub component_id: ComponentId,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeAddComponent)]
pub struct RuntimeAddComponentResponse {
    pub succeed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeRemoveComponent)]
pub struct RuntimeRemoveComponent {
    pub entity_id: EntityId,
    pub component_id: ComponentId,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeRemoveComponent)]
pub struct RuntimeRemoveComponentResponse {
    pub succeed: bool,
}

/// Fire-and-forget: no timeout is synthesized for it. Stale updates from a worker that just
/// lost authority are silently dropped, not nacked.
#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeComponentUpdate)]
pub struct RuntimeComponentUpdate {
    pub entity_id: EntityId,
    pub component_id: ComponentId,
    pub payload: Vec<u8>,
    pub position: Option<(i32, i32)>,
}

/// Fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeComponentInterestQueryUpdate)]
pub struct RuntimeComponentInterestQueryUpdate {
    pub entity_id: EntityId,
    pub component_id: ComponentId,
    pub queries: Vec<ComponentQuery>,
}

/// Fire-and-forget periodic self-report a worker sends the runtime (traffic/ownership
/// accounting); the runtime's ack is likewise fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeWorkerReportAcknowledge)]
pub struct RuntimeWorkerReportAcknowledge {
    pub entities_owned: u32,
}

// ---------------------------------------------------------------------------------------
// Runtime -> Worker (all fire-and-forget pushes)
// ---------------------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(WorkerAddComponent)]
pub struct WorkerAddComponent {
    pub entity_id: EntityId,
    pub component_id: ComponentId,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(WorkerRemoveComponent)]
pub struct WorkerRemoveComponent {
    pub entity_id: EntityId,
    pub component_id: ComponentId,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(WorkerLayerAuthorityGain)]
pub struct WorkerLayerAuthorityGain {
    pub entity_id: EntityId,
    pub layer_id: LayerId,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(WorkerLayerAuthorityLost)]
pub struct WorkerLayerAuthorityLost {
    pub entity_id: EntityId,
    pub layer_id: LayerId,
}

/// Fire-and-forget interest-query fan-out, chunked with [`chunk_components`] when the
/// accumulated payload exceeds the 500-byte threshold.
#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeComponentInterestQueryResult)]
pub struct RuntimeComponentInterestQueryResult {
    pub querying_entity: EntityId,
    pub matched_entity: EntityId,
    pub components: Vec<(ComponentId, Vec<u8>)>,
}

// ---------------------------------------------------------------------------------------
// Inspector <-> Runtime
// ---------------------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeGetEntitiesInfo)]
pub struct RuntimeGetEntitiesInfo;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityInfo {
    pub entity_id: EntityId,
    pub mask: ComponentMask,
    pub position: (i32, i32),
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeGetEntitiesInfo)]
pub struct RuntimeGetEntitiesInfoResponse {
    pub entities: Vec<EntityInfo>,
    /// `true` if more chunks follow (accumulated size exceeded the 500-byte budget).
    pub more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeGetCellsInfos)]
pub struct RuntimeGetCellsInfos;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellInfo {
    pub coordinates: (i32, i32),
    pub entity_count: u32,
    /// One owning worker client hash per layer (`None` = unowned), indexed by layer index.
    pub layer_owners: Vec<Option<u64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeGetCellsInfos)]
pub struct RuntimeGetCellsInfosResponse {
    pub cells: Vec<CellInfo>,
    pub more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeGetWorkersInfos)]
pub struct RuntimeGetWorkersInfos;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub layer_id: LayerId,
    pub client_hash: u64,
    pub entity_count: u32,
    pub bytes_in_per_sec: u32,
    pub bytes_out_per_sec: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeGetWorkersInfos)]
pub struct RuntimeGetWorkersInfosResponse {
    pub workers: Vec<WorkerInfo>,
    pub more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeInspectorQuery)]
pub struct RuntimeInspectorQuery {
    pub query: ComponentQuery,
    pub origin: (i32, i32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectorQueryMatch {
    pub entity_id: EntityId,
    pub components: Vec<(ComponentId, Vec<u8>)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(RuntimeInspectorQuery)]
pub struct RuntimeInspectorQueryResponse {
    pub matches: Vec<InspectorQueryMatch>,
    pub more: bool,
}

// ---------------------------------------------------------------------------------------
// Runtime <-> Spawner
// ---------------------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(SpawnWorkerForLayer)]
pub struct SpawnWorkerForLayer {
    pub layer_id: LayerId,
}

#[derive(Debug, Clone, Serialize, Deserialize, WireMessage)]
#[wire(SpawnWorkerForLayer)]
pub struct SpawnWorkerForLayerResponse {
    pub succeed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = MessageHeader {
            message_type: MessageType::RuntimeAddEntity,
            request_index: 42,
            is_request: true,
        };
        let mut buf = Vec::new();
        encode_header(&mut buf, &header);
        let (decoded, rest) = decode_header(&buf).unwrap();
        assert_eq!(decoded, header);
        assert!(rest.is_empty());
    }

    #[test]
    fn body_round_trips_through_encode_decode() {
        let body = RuntimeAddEntity {
            entity_id: EntityId(7),
            components: vec![(0, vec![1, 2, 3])],
            position: (10, -10),
        };
        let bytes = encode(1, true, &body).unwrap();
        let (header, decoded): (_, RuntimeAddEntity) = decode_message(&bytes).unwrap();
        assert_eq!(header.message_type, MessageType::RuntimeAddEntity);
        assert_eq!(decoded.entity_id, body.entity_id);
        assert_eq!(decoded.components, body.components);
    }

    #[test]
    fn truncated_header_is_rejected() {
        let err = decode_header(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, WireError::Truncated(3, HEADER_LEN)));
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&999u64.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.push(0);
        let err = decode_header(&buf).unwrap_err();
        assert!(matches!(err, WireError::UnknownType(999)));
    }

    #[test]
    fn chunking_never_splits_a_single_component() {
        let components = vec![(0u8, vec![0u8; 10]), (1, vec![0u8; 600]), (2, vec![0u8; 10])];
        let chunks = chunk_components(components, 500);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].len(), 1);
        assert_eq!(chunks[1][0].1.len(), 600);
    }
}
