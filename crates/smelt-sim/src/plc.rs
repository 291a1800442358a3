//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Synthetic furnace process data for mock mode."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Instant;

use async_trait::async_trait;
use smelt_plc::decode::{
    encode_arc_block, encode_device_block, encode_hopper_block, encode_sensor_block, BlockWriter,
};
use smelt_plc::register_map::{
    db18, DB_ARC, DB_DEVICE_COMM, DB_DEVICE_STATUS, DB_HOPPER, DB_HOPPER_LIMIT, DB_SENSOR,
};
use smelt_plc::{MemoryTransport, PlcTransport, Result, TransportKind};
use tracing::debug;

use crate::generator::FurnaceGenerator;

/// Upper limit the simulated DB18 starts with.
pub const SIMULATED_UPPER_LIMIT_KG: i32 = 5200;

/// Transport that answers reads from a synthetic furnace.
///
/// Each read regenerates the addressed block at the current elapsed time and
/// then serves it from an in-memory image, so offsets and sizes behave like
/// the real PLC.
#[derive(Debug)]
pub struct SimulatedPlc {
    image: MemoryTransport,
    generator: FurnaceGenerator,
    started: Instant,
    time_scale: f64,
}

impl SimulatedPlc {
    pub fn new(seed: u64) -> Self {
        let image = MemoryTransport::new(TransportKind::Simulated);
        let mut limit = BlockWriter::new(db18::UPPER_LIMIT + db18::SIZE);
        limit.put_i32(db18::UPPER_LIMIT, SIMULATED_UPPER_LIMIT_KG);
        image.set_block(DB_HOPPER_LIMIT, limit.into_bytes());
        Self {
            image,
            generator: FurnaceGenerator::new(seed),
            started: Instant::now(),
            time_scale: 1.0,
        }
    }

    /// Run the synthetic process faster than wall time.
    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale.max(0.0);
        self
    }

    /// Shared handle on the block image.
    pub fn image(&self) -> MemoryTransport {
        self.image.clone()
    }

    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * self.time_scale
    }

    fn refresh(&mut self, db: u16) {
        let t = self.elapsed();
        let bytes = match db {
            DB_ARC => encode_arc_block(&self.generator.arc(t)),
            DB_SENSOR => encode_sensor_block(&self.generator.sensor(t)),
            DB_HOPPER => encode_hopper_block(&self.generator.hopper(t)),
            DB_DEVICE_COMM | DB_DEVICE_STATUS => {
                encode_device_block(db, &self.generator.devices(db, t))
            }
            _ => return,
        };
        debug!(db, t, "simulated block refreshed");
        self.image.set_block(db, bytes);
    }
}

#[async_trait]
impl PlcTransport for SimulatedPlc {
    fn kind(&self) -> TransportKind {
        TransportKind::Simulated
    }

    async fn connect(&mut self) -> Result<()> {
        self.image.connect().await
    }

    fn is_connected(&self) -> bool {
        self.image.is_connected()
    }

    async fn read_area(&mut self, db: u16, offset: usize, size: usize) -> Result<Vec<u8>> {
        self.refresh(db);
        self.image.read_area(db, offset, size).await
    }

    async fn write_area(&mut self, db: u16, offset: usize, data: &[u8]) -> Result<()> {
        self.image.write_area(db, offset, data).await
    }

    async fn disconnect(&mut self) {
        self.image.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smelt_plc::register_map::{db1, db32, devices};
    use smelt_plc::{decode_arc_block, decode_device_block, decode_upper_limit, PlcError};

    #[tokio::test]
    async fn reads_decode_like_the_real_layout() {
        let mut plc = SimulatedPlc::new(11);
        assert!(matches!(
            plc.read_area(DB_ARC, 0, db1::SIZE).await,
            Err(PlcError::Disconnected)
        ));
        plc.connect().await.unwrap();

        let arc = decode_arc_block(&plc.read_area(DB_ARC, 0, db1::SIZE).await.unwrap()).unwrap();
        assert_eq!(arc.setpoint, [5200; 3]);
        assert!(arc.emergency_enabled);

        let sensor = plc.read_area(DB_SENSOR, 0, db32::SIZE).await.unwrap();
        assert_eq!(sensor.len(), db32::SIZE);

        let limit = plc
            .read_area(DB_HOPPER_LIMIT, db18::UPPER_LIMIT, db18::SIZE)
            .await
            .unwrap();
        assert_eq!(decode_upper_limit(&limit).unwrap(), SIMULATED_UPPER_LIMIT_KG);

        let status = plc
            .read_area(DB_DEVICE_STATUS, 0, devices::size(DB_DEVICE_STATUS))
            .await
            .unwrap();
        let table = decode_device_block(DB_DEVICE_STATUS, &status).unwrap();
        assert_eq!(table.len(), 4);
        assert!(table.iter().all(|device| device.done && !device.error));
    }
}
