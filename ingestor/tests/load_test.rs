//! Broker load tests. Need a running broker and ingestor:
//! `cargo test --test load_test -- --ignored --nocapture`

use chrono::Utc;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::time::sleep;

const SENSOR_TYPES: [(&str, &str); 4] = [
    ("temperature", "°C"),
    ("humidity", "%"),
    ("pressure", "hPa"),
    ("light", "%"),
];

fn reading(i: u64, devices: u64) -> (String, Vec<u8>) {
    let mut rng = rand::thread_rng();
    let (kind, unit) = SENSOR_TYPES[(i % SENSOR_TYPES.len() as u64) as usize];
    let device_id = format!("load-test-dev-{}", i % devices);
    let payload = json!({
        "device_id": device_id,
        "owner_id": (i % 5) + 1,
        "type": kind,
        "value": rng.gen_range(0.0..100.0),
        "unit": unit,
        "timestamp": Utc::now().naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
    });
    (
        format!("cloud-security-iot/iot/{}/{}", kind, device_id),
        payload.to_string().into_bytes(),
    )
}

async fn run_load(client_id: &str, duration_secs: u64, target_rate: u64, devices: u64) -> (u64, u64, Duration) {
    let mut mqtt_options = MqttOptions::new(client_id, "localhost", 1883);
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                eprintln!("MQTT error: {}", e);
                break;
            }
        }
    });

    sleep(Duration::from_millis(500)).await;

    let total_messages = duration_secs * target_rate;
    let burst_size = 100;
    let delay_per_burst = Duration::from_micros((burst_size * 1_000_000) / target_rate);

    let start = Instant::now();
    let mut sent_count = 0;
    let mut error_count = 0;

    for batch_start in (0..total_messages).step_by(burst_size as usize) {
        for i in batch_start..std::cmp::min(batch_start + burst_size, total_messages) {
            let (topic, payload) = reading(i, devices);
            match client.publish(topic, QoS::AtLeastOnce, false, payload).await {
                Ok(_) => sent_count += 1,
                Err(e) => {
                    error_count += 1;
                    if error_count < 10 {
                        eprintln!("Send error: {}", e);
                    }
                }
            }
        }

        sleep(delay_per_burst).await;

        if (batch_start + burst_size) % 5000 == 0 {
            let rate = (batch_start + burst_size) as f64 / start.elapsed().as_secs_f64();
            println!("{} msgs ({:.0} msg/s)", batch_start + burst_size, rate);
        }
    }

    (sent_count, error_count, start.elapsed())
}

#[tokio::test]
#[ignore]
async fn test_1000_messages_per_second() {
    let (sent, errors, duration) = run_load("load-test", 10, 1000, 10).await;
    let rate = sent as f64 / duration.as_secs_f64();

    println!("Sent {} in {:.2}s ({:.2} msg/s), {} errors", sent, duration.as_secs_f64(), rate, errors);

    assert!(rate >= 900.0, "Throughput too low: {:.2} msg/s (expected >= 900)", rate);
    assert_eq!(errors, 0, "Too many errors: {}", errors);
}

#[tokio::test]
#[ignore]
async fn test_sustained_load_60_seconds() {
    let (sent, _, duration) = run_load("load-test-sustained", 60, 1000, 50).await;
    assert!(sent as f64 / duration.as_secs_f64() >= 900.0);
}
