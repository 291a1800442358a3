//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "PLC connectivity and register decoding."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Minimal S7 client over ISO-on-TCP (RFC 1006): session setup plus
//! single-item DB read and write requests.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use smelt_common::PlcConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{PlcError, Result};
use crate::transport::{PlcTransport, TransportKind};

const TPKT_VERSION: u8 = 0x03;
const TPKT_HEADER_LEN: usize = 4;
const COTP_CONNECT_REQUEST: u8 = 0xE0;
const COTP_CONNECT_CONFIRM: u8 = 0xD0;
const COTP_DATA: [u8; 3] = [0x02, 0xF0, 0x80];

const S7_PROTOCOL_ID: u8 = 0x32;
const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK_DATA: u8 = 0x03;
const JOB_HEADER_LEN: usize = 10;
const ACK_HEADER_LEN: usize = 12;

const FN_SETUP_COMM: u8 = 0xF0;
const FN_READ_VAR: u8 = 0x04;
const FN_WRITE_VAR: u8 = 0x05;
const AREA_DB: u8 = 0x84;
const SYNTAX_ANY: u8 = 0x10;
const TS_BYTE: u8 = 0x02;
const RET_SUCCESS: u8 = 0xFF;

const REQUESTED_PDU: u16 = 480;
/// Protocol overhead around the payload of a single-item read response.
const READ_OVERHEAD: usize = 18;
/// Protocol overhead around the payload of a single-item write request.
const WRITE_OVERHEAD: usize = 28;

/// S7 session with a furnace PLC.
#[derive(Debug)]
pub struct S7Transport {
    endpoint: String,
    rack: u16,
    slot: u16,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    pdu_size: usize,
    pdu_ref: u16,
}

impl S7Transport {
    pub fn new(endpoint: impl Into<String>, rack: u16, slot: u16, connect_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            rack,
            slot,
            connect_timeout,
            stream: None,
            pdu_size: REQUESTED_PDU as usize,
            pdu_ref: 0,
        }
    }

    pub fn from_config(config: &PlcConfig) -> Self {
        Self::new(config.endpoint(), config.rack, config.slot, config.connect_timeout)
    }

    /// PDU size negotiated with the PLC.
    pub fn pdu_size(&self) -> usize {
        self.pdu_size
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    fn connect_request(&self) -> BytesMut {
        let remote_tsap = (self.rack as u8) * 0x20 + self.slot as u8;
        let mut cotp = BytesMut::with_capacity(18);
        cotp.put_u8(17);
        cotp.put_u8(COTP_CONNECT_REQUEST);
        cotp.put_u16(0x0000);
        cotp.put_u16(0x0001);
        cotp.put_u8(0x00);
        // TPDU size 1024
        cotp.put_slice(&[0xC0, 0x01, 0x0A]);
        cotp.put_slice(&[0xC1, 0x02, 0x01, 0x00]);
        cotp.put_slice(&[0xC2, 0x02, 0x01, remote_tsap]);
        tpkt(&cotp)
    }

    async fn exchange(&mut self, params: &[u8], data: &[u8]) -> Result<AckData> {
        let pdu_ref = self.next_ref();
        let mut pdu = BytesMut::with_capacity(COTP_DATA.len() + JOB_HEADER_LEN + params.len() + data.len());
        pdu.put_slice(&COTP_DATA);
        pdu.put_u8(S7_PROTOCOL_ID);
        pdu.put_u8(ROSCTR_JOB);
        pdu.put_u16(0x0000);
        pdu.put_u16(pdu_ref);
        pdu.put_u16(params.len() as u16);
        pdu.put_u16(data.len() as u16);
        pdu.put_slice(params);
        pdu.put_slice(data);
        let frame = tpkt(&pdu);

        let stream = self.stream.as_mut().ok_or(PlcError::Disconnected)?;
        stream.write_all(&frame).await?;
        let reply = read_tpkt(stream).await?;
        AckData::parse(&reply)
    }

    async fn read_chunk(&mut self, db: u16, offset: usize, size: usize) -> Result<Vec<u8>> {
        let params = item_params(FN_READ_VAR, db, offset, size)?;
        let ack = self.exchange(&params, &[]).await?;
        let data = ack.data;
        if data.len() < 4 {
            return Err(PlcError::Protocol(format!(
                "read response for DB{db} too short ({} bytes)",
                data.len()
            )));
        }
        if data[0] != RET_SUCCESS {
            return Err(PlcError::AccessDenied {
                db,
                offset,
                code: data[0],
            });
        }
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        // transport sizes 0x03/0x04 report the length in bits
        let length = match data[1] {
            0x03 | 0x04 | 0x05 => length / 8,
            _ => length,
        };
        let payload = data
            .get(4..4 + length)
            .ok_or_else(|| PlcError::Protocol(format!("truncated payload for DB{db}")))?;
        if payload.len() != size {
            return Err(PlcError::Protocol(format!(
                "DB{db} returned {} bytes, expected {size}",
                payload.len()
            )));
        }
        Ok(payload.to_vec())
    }

    async fn write_chunk(&mut self, db: u16, offset: usize, chunk: &[u8]) -> Result<()> {
        let params = item_params(FN_WRITE_VAR, db, offset, chunk.len())?;
        let mut data = BytesMut::with_capacity(4 + chunk.len());
        data.put_u8(0x00);
        data.put_u8(0x04);
        data.put_u16((chunk.len() * 8) as u16);
        data.put_slice(chunk);
        let ack = self.exchange(&params, &data).await?;
        match ack.data.first() {
            Some(&RET_SUCCESS) => Ok(()),
            Some(&code) => Err(PlcError::AccessDenied { db, offset, code }),
            None => Err(PlcError::Protocol(format!("empty write response for DB{db}"))),
        }
    }
}

#[async_trait]
impl PlcTransport for S7Transport {
    fn kind(&self) -> TransportKind {
        TransportKind::Fieldbus
    }

    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.endpoint))
            .await
            .map_err(|_| PlcError::Timeout {
                operation: "connect",
                timeout: self.connect_timeout,
            })??;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);

        let request = self.connect_request();
        let confirm = {
            let stream = self.stream.as_mut().ok_or(PlcError::Disconnected)?;
            stream.write_all(&request).await?;
            read_tpkt(stream).await?
        };
        if confirm.get(1) != Some(&COTP_CONNECT_CONFIRM) {
            self.stream = None;
            return Err(PlcError::Protocol("ISO connection refused".to_owned()));
        }

        let setup = [
            FN_SETUP_COMM,
            0x00,
            0x00,
            0x01,
            0x00,
            0x01,
            (REQUESTED_PDU >> 8) as u8,
            (REQUESTED_PDU & 0xFF) as u8,
        ];
        let ack = match self.exchange(&setup, &[]).await {
            Ok(ack) => ack,
            Err(err) => {
                self.stream = None;
                return Err(err);
            }
        };
        if let Some(bytes) = ack.params.get(6..8) {
            self.pdu_size = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        }
        if self.pdu_size <= WRITE_OVERHEAD {
            self.stream = None;
            return Err(PlcError::Protocol(format!(
                "negotiated PDU size {} is unusable",
                self.pdu_size
            )));
        }
        info!(endpoint = %self.endpoint, rack = self.rack, slot = self.slot, pdu = self.pdu_size, "S7 session established");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn read_area(&mut self, db: u16, offset: usize, size: usize) -> Result<Vec<u8>> {
        let max_chunk = self.pdu_size - READ_OVERHEAD;
        let mut out = Vec::with_capacity(size);
        while out.len() < size {
            let chunk = (size - out.len()).min(max_chunk);
            let bytes = self.read_chunk(db, offset + out.len(), chunk).await?;
            out.extend_from_slice(&bytes);
        }
        debug!(db, offset, size, "S7 read complete");
        Ok(out)
    }

    async fn write_area(&mut self, db: u16, offset: usize, data: &[u8]) -> Result<()> {
        let max_chunk = self.pdu_size - WRITE_OVERHEAD;
        for (index, chunk) in data.chunks(max_chunk).enumerate() {
            self.write_chunk(db, offset + index * max_chunk, chunk).await?;
        }
        debug!(db, offset, len = data.len(), "S7 write complete");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            info!(endpoint = %self.endpoint, "S7 session closed");
        }
    }
}

/// Parameters and data of an ack-data PDU.
#[derive(Debug)]
struct AckData {
    params: Vec<u8>,
    data: Vec<u8>,
}

impl AckData {
    /// `frame` is the TPKT payload, starting at the COTP header.
    fn parse(frame: &[u8]) -> Result<Self> {
        let cotp_len = *frame
            .first()
            .ok_or_else(|| PlcError::Protocol("empty COTP frame".to_owned()))? as usize;
        let pdu = frame
            .get(cotp_len + 1..)
            .ok_or_else(|| PlcError::Protocol("truncated COTP frame".to_owned()))?;
        if pdu.len() < ACK_HEADER_LEN || pdu[0] != S7_PROTOCOL_ID {
            return Err(PlcError::Protocol("malformed S7 header".to_owned()));
        }
        if pdu[1] != ROSCTR_ACK_DATA {
            return Err(PlcError::Protocol(format!("unexpected ROSCTR {:#04x}", pdu[1])));
        }
        let (class, code) = (pdu[10], pdu[11]);
        if class != 0 || code != 0 {
            return Err(PlcError::Protocol(format!(
                "PLC reported error class {class:#04x} code {code:#04x}"
            )));
        }
        let param_len = u16::from_be_bytes([pdu[6], pdu[7]]) as usize;
        let data_len = u16::from_be_bytes([pdu[8], pdu[9]]) as usize;
        let params_end = ACK_HEADER_LEN + param_len;
        let params = pdu
            .get(ACK_HEADER_LEN..params_end)
            .ok_or_else(|| PlcError::Protocol("truncated S7 parameters".to_owned()))?;
        let data = pdu
            .get(params_end..params_end + data_len)
            .ok_or_else(|| PlcError::Protocol("truncated S7 data".to_owned()))?;
        Ok(Self {
            params: params.to_vec(),
            data: data.to_vec(),
        })
    }
}

fn tpkt(payload: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(TPKT_HEADER_LEN + payload.len());
    frame.put_u8(TPKT_VERSION);
    frame.put_u8(0x00);
    frame.put_u16((TPKT_HEADER_LEN + payload.len()) as u16);
    frame.put_slice(payload);
    frame
}

async fn read_tpkt(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut header = [0u8; TPKT_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    if header[0] != TPKT_VERSION {
        return Err(PlcError::Protocol(format!(
            "unexpected TPKT version {:#04x}",
            header[0]
        )));
    }
    let total = u16::from_be_bytes([header[2], header[3]]) as usize;
    if total <= TPKT_HEADER_LEN {
        return Err(PlcError::Protocol(format!("invalid TPKT length {total}")));
    }
    let mut payload = vec![0u8; total - TPKT_HEADER_LEN];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Function code, item count and one DB ANY-pointer.
fn item_params(function: u8, db: u16, offset: usize, len: usize) -> Result<[u8; 14]> {
    let bit_address = offset
        .checked_mul(8)
        .filter(|address| *address <= 0x00FF_FFFF)
        .ok_or_else(|| PlcError::Config(format!("offset {offset} outside addressable range")))?;
    let len = u16::try_from(len)
        .map_err(|_| PlcError::Config(format!("request length {len} too large")))?;
    let [len_hi, len_lo] = len.to_be_bytes();
    let [db_hi, db_lo] = db.to_be_bytes();
    Ok([
        function,
        0x01,
        0x12,
        0x0A,
        SYNTAX_ANY,
        TS_BYTE,
        len_hi,
        len_lo,
        db_hi,
        db_lo,
        AREA_DB,
        (bit_address >> 16) as u8,
        (bit_address >> 8) as u8,
        bit_address as u8,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn ack(params: &[u8], data: &[u8]) -> Vec<u8> {
        let mut pdu = BytesMut::new();
        pdu.put_slice(&COTP_DATA);
        pdu.put_slice(&[S7_PROTOCOL_ID, ROSCTR_ACK_DATA, 0, 0, 0, 1]);
        pdu.put_u16(params.len() as u16);
        pdu.put_u16(data.len() as u16);
        pdu.put_slice(&[0, 0]);
        pdu.put_slice(params);
        pdu.put_slice(data);
        tpkt(&pdu).to_vec()
    }

    /// Serves one session over a 64-byte DB image and returns every write it saw.
    async fn fake_plc(listener: TcpListener, mut image: Vec<u8>) -> Vec<(usize, Vec<u8>)> {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut writes = Vec::new();
        let request = read_tpkt(&mut socket).await.unwrap();
        assert_eq!(request[1], COTP_CONNECT_REQUEST);
        assert_eq!(&request[14..18], &[0xC2, 0x02, 0x01, 0x01]);
        let mut cc = request.clone();
        cc[1] = COTP_CONNECT_CONFIRM;
        socket.write_all(&tpkt(&cc)).await.unwrap();

        loop {
            let Ok(frame) = read_tpkt(&mut socket).await else {
                return writes;
            };
            let pdu = &frame[3..];
            let params = &pdu[JOB_HEADER_LEN..];
            match params[0] {
                FN_SETUP_COMM => {
                    socket
                        .write_all(&ack(&[FN_SETUP_COMM, 0, 0, 1, 0, 1, 0, 64], &[]))
                        .await
                        .unwrap();
                }
                FN_READ_VAR => {
                    let len = u16::from_be_bytes([params[6], params[7]]) as usize;
                    let addr = ((params[11] as usize) << 16)
                        | ((params[12] as usize) << 8)
                        | params[13] as usize;
                    let offset = addr / 8;
                    let reply = match image.get(offset..offset + len) {
                        Some(bytes) => {
                            let mut data = vec![RET_SUCCESS, 0x04];
                            data.extend_from_slice(&((len * 8) as u16).to_be_bytes());
                            data.extend_from_slice(bytes);
                            ack(&[FN_READ_VAR, 1], &data)
                        }
                        None => ack(&[FN_READ_VAR, 1], &[0x05, 0x00, 0x00, 0x00]),
                    };
                    socket.write_all(&reply).await.unwrap();
                }
                FN_WRITE_VAR => {
                    let addr = ((params[11] as usize) << 16)
                        | ((params[12] as usize) << 8)
                        | params[13] as usize;
                    let offset = addr / 8;
                    let data = &params[14..];
                    let payload = data[4..].to_vec();
                    image[offset..offset + payload.len()].copy_from_slice(&payload);
                    writes.push((offset, payload));
                    socket
                        .write_all(&ack(&[FN_WRITE_VAR, 1], &[RET_SUCCESS]))
                        .await
                        .unwrap();
                }
                other => panic!("unexpected function {other:#04x}"),
            }
        }
    }

    #[test]
    fn any_pointer_encodes_bit_address() {
        let params = item_params(FN_READ_VAR, 18, 40, 4).unwrap();
        assert_eq!(
            params,
            [0x04, 0x01, 0x12, 0x0A, 0x10, 0x02, 0x00, 0x04, 0x00, 0x12, 0x84, 0x00, 0x01, 0x40]
        );
    }

    #[tokio::test]
    async fn reads_and_writes_through_negotiated_pdu() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let image: Vec<u8> = (0..64u8).collect();
        let server = tokio::spawn(fake_plc(listener, image.clone()));

        let mut transport = S7Transport::new(endpoint, 0, 1, Duration::from_secs(1));
        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(transport.pdu_size(), 64);

        // 60 bytes exceed the 46-byte read window and arrive in two requests
        let bytes = transport.read_area(1, 2, 60).await.unwrap();
        assert_eq!(bytes, image[2..62].to_vec());

        let err = transport.read_area(1, 60, 8).await.unwrap_err();
        assert!(matches!(err, PlcError::AccessDenied { code: 0x05, .. }));

        transport.write_area(18, 40, &4900i32.to_be_bytes()).await.unwrap();
        transport.disconnect().await;
        assert!(!transport.is_connected());

        let writes = server.await.unwrap();
        assert_eq!(writes, vec![(40, 4900i32.to_be_bytes().to_vec())]);
    }

    #[tokio::test]
    async fn refused_endpoint_is_an_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        drop(listener);
        let mut transport = S7Transport::new(endpoint, 0, 1, Duration::from_millis(500));
        let err = transport.connect().await.unwrap_err();
        assert!(err.is_connection_fault());
        assert!(!transport.is_connected());
    }
}
