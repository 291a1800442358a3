//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Setpoint writes read back through the shared PLC connection."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use smelt_plc::decode::{encode_arc_block, encode_sensor_block, BlockWriter};
use smelt_plc::register_map::{db1, db18, DB_ARC, DB_HOPPER_LIMIT, DB_SENSOR};
use smelt_plc::{
    decode_arc_block, decode_block, decode_upper_limit, ArcRaw, MemoryTransport, PlcConnection,
    PlcWriter, SensorRaw, WriteRecord,
};

fn plc_image() -> MemoryTransport {
    let image = MemoryTransport::default();
    image.set_block(
        DB_ARC,
        encode_arc_block(&ArcRaw {
            current: [4800, 4900, 5000],
            voltage: [88.0, 90.0, 91.5],
            arc_limit: 8000,
            emergency_delay_ms: 500,
            ..ArcRaw::default()
        }),
    );
    image.set_block(
        DB_SENSOR,
        encode_sensor_block(&SensorRaw {
            hopper_weight: 2100.0,
            valve_byte: 0b0000_0110,
            fan_running: true,
            ..SensorRaw::default()
        }),
    );
    let mut limit = BlockWriter::new(db18::UPPER_LIMIT + db18::SIZE);
    limit.put_i32(db18::UPPER_LIMIT, 4900);
    image.set_block(DB_HOPPER_LIMIT, limit.into_bytes());
    image
}

async fn connected(image: &MemoryTransport) -> Arc<PlcConnection> {
    let connection = Arc::new(PlcConnection::new(
        Box::new(image.clone()),
        Duration::from_millis(500),
    ));
    assert!(connection.connect().await);
    connection
}

#[tokio::test]
async fn arc_limit_and_delay_land_in_db1() {
    let image = plc_image();
    let connection = connected(&image).await;
    let writer = PlcWriter::new(Arc::clone(&connection));

    let outcome = writer.write_arc_limit_and_delay_to_plc(7500, 800).await;
    assert_eq!(
        serde_json::to_value(&outcome).unwrap(),
        json!({
            "success": true,
            "message": "arc limit set to 7500 A, emergency delay set to 800 ms"
        })
    );

    // two separate requests; the reserved word between them is never written
    assert_eq!(
        image.writes(),
        vec![
            WriteRecord {
                db: DB_ARC,
                offset: db1::ARC_LIMIT,
                data: 7500i16.to_be_bytes().to_vec(),
            },
            WriteRecord {
                db: DB_ARC,
                offset: db1::EMERGENCY_DELAY,
                data: 800i32.to_be_bytes().to_vec(),
            },
        ]
    );

    let bytes = connection.read_db(DB_ARC, 0, db1::SIZE).await.unwrap();
    let raw = decode_arc_block(&bytes).unwrap();
    assert_eq!(raw.arc_limit, 7500);
    assert_eq!(raw.emergency_delay_ms, 800);
    assert_eq!(raw.current, [4800, 4900, 5000]);
    assert_eq!(connection.stats().writes, 2);
}

#[tokio::test]
async fn hopper_limit_is_rounded_and_read_back() {
    let image = plc_image();
    let connection = connected(&image).await;
    let writer = PlcWriter::new(Arc::clone(&connection));

    let outcome = writer.write_hopper_upper_limit_to_plc(5600.4).await;
    assert!(outcome.success, "{}", outcome.message);

    let bytes = connection
        .read_db(DB_HOPPER_LIMIT, db18::UPPER_LIMIT, db18::SIZE)
        .await
        .unwrap();
    assert_eq!(decode_upper_limit(&bytes).unwrap(), 5600);

    let rejected = writer.write_hopper_upper_limit_to_plc(-1.0).await;
    assert!(!rejected.success);
    assert_eq!(image.writes().len(), 1);
}

#[tokio::test]
async fn writes_report_a_dropped_link() {
    let image = plc_image();
    let connection = connected(&image).await;
    let writer = PlcWriter::new(Arc::clone(&connection));

    image.set_offline(true);
    let outcome = writer.write_emergency_delay_to_plc(300).await;
    let value = serde_json::to_value(&outcome).unwrap();
    assert_eq!(value["success"], json!(false));
    assert!(outcome.message.starts_with("emergency delay"), "{}", outcome.message);
    assert!(!connection.is_connected());
    assert!(image.writes().is_empty());

    image.set_offline(false);
    let retried = writer.write_emergency_delay_to_plc(300).await;
    assert!(retried.success, "{}", retried.message);
}

#[tokio::test]
async fn diagnostics_map_serialises_flat() {
    let image = plc_image();
    let connection = connected(&image).await;
    let bytes = connection
        .read_db(DB_SENSOR, 0, smelt_plc::register_map::db32::SIZE)
        .await
        .unwrap();
    let fields = decode_block(DB_SENSOR, &bytes).unwrap();
    let value = serde_json::to_value(&fields).unwrap();

    assert_eq!(value["hopper_weight"], json!(2100.0));
    assert_eq!(value["valve_status"], json!(6));
    assert_eq!(value["fan_running"], json!(true));
    assert_eq!(value["valve_1_open"], json!(true));
    assert_eq!(value["valve_2_close"], json!(true));
    assert_eq!(value["valve_1_close"], json!(false));
    // field order follows the block layout
    assert_eq!(fields.keys().last().map(String::as_str), Some("fan_running"));
}
