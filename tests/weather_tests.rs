use async_trait::async_trait;
use smartcloset::accessory::{Accessory, AccessorySet};
use smartcloset::bus::{handler_fn, EventBus, HandlerError};
use smartcloset::events::{Event, EventKind};
use smartcloset::weather::{
    evaluate, StaticWeatherSource, WeatherError, WeatherMetrics, WeatherService, WeatherSource,
    WeatherThresholds,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn metrics(temp: &str, pop: &str, uv: &str, dust: &str) -> WeatherMetrics {
    WeatherMetrics {
        current_temp: Some(temp.to_string()),
        precipitation: Some(pop.to_string()),
        uv_index: Some(uv.to_string()),
        dust: Some(dust.to_string()),
        humidity: Some("50".to_string()),
    }
}

fn set(items: &[Accessory]) -> AccessorySet {
    items.iter().copied().collect()
}

#[test]
fn test_rainy_cold_dusty_morning() {
    let thresholds = WeatherThresholds {
        precipitation: 0.0,
        uv_index: 3.0,
        cold_temp: 10.0,
        ..WeatherThresholds::default()
    };

    let needed = evaluate(&metrics("5", "80", "2", "나쁨"), &thresholds);

    assert_eq!(
        needed,
        set(&[Accessory::Umbrella, Accessory::Mask, Accessory::Warmth])
    );
}

#[test]
fn test_each_rule_fires_on_its_boundary() {
    let thresholds = WeatherThresholds::default();

    assert_eq!(
        evaluate(&metrics("20", "20", "0", "좋음"), &thresholds),
        set(&[Accessory::Umbrella])
    );
    assert_eq!(
        evaluate(&metrics("20", "0", "3", "좋음"), &thresholds),
        set(&[Accessory::SunProtection])
    );
    assert_eq!(
        evaluate(&metrics("20", "0", "0", "매우 나쁨"), &thresholds),
        set(&[Accessory::Mask])
    );
    assert_eq!(
        evaluate(&metrics("10", "0", "0", "좋음"), &thresholds),
        set(&[Accessory::Warmth])
    );
    assert!(evaluate(&metrics("10.5", "19", "2.9", "보통"), &thresholds).is_empty());
}

#[test]
fn test_malformed_field_behaves_like_absent_field() {
    let thresholds = WeatherThresholds::default();
    let base = metrics("5", "80", "7", "나쁨");

    let variants: [(&str, fn(&mut WeatherMetrics, Option<String>)); 3] = [
        ("precipitation", |m, v| m.precipitation = v),
        ("uv_index", |m, v| m.uv_index = v),
        ("current_temp", |m, v| m.current_temp = v),
    ];

    for (field, set_field) in variants {
        let mut absent = base.clone();
        set_field(&mut absent, None);

        for garbage in ["", "--", "n/a", "NaN", "많음", "1e400"] {
            let mut malformed = base.clone();
            set_field(&mut malformed, Some(garbage.to_string()));
            assert_eq!(
                evaluate(&malformed, &thresholds),
                evaluate(&absent, &thresholds),
                "field {} = {:?}",
                field,
                garbage
            );
        }
    }
}

#[test]
fn test_unit_suffixes_are_tolerated() {
    let thresholds = WeatherThresholds::default();
    let needed = evaluate(&metrics("3℃", "60%", "8", "보통"), &thresholds);
    assert_eq!(
        needed,
        set(&[Accessory::Umbrella, Accessory::SunProtection, Accessory::Warmth])
    );
}

#[test]
fn test_empty_snapshot_needs_nothing() {
    assert!(evaluate(&WeatherMetrics::default(), &WeatherThresholds::default()).is_empty());
}

fn record_kinds(bus: &EventBus, log: &Arc<Mutex<Vec<Event>>>, kind: EventKind) {
    let log = Arc::clone(log);
    bus.subscribe(
        kind,
        handler_fn("recorder", move |event| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push((*event).clone());
                Ok::<(), HandlerError>(())
            }
        }),
    );
}

#[tokio::test]
async fn test_arrival_publishes_weather_then_needs() {
    let bus = Arc::new(EventBus::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    record_kinds(&bus, &log, EventKind::WeatherUpdated);
    record_kinds(&bus, &log, EventKind::AccessoriesNeeded);

    let source = Arc::new(StaticWeatherSource::new(metrics("25", "90", "1", "보통")));
    let service = Arc::new(WeatherService::new(
        Arc::clone(&bus),
        source,
        WeatherThresholds::default(),
    ));
    service.attach();

    bus.publish(Event::presence_arrived(Some(60.0))).await.unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].kind(), EventKind::WeatherUpdated);
    assert_eq!(log[1].kind(), EventKind::AccessoriesNeeded);

    let (needed, unknown) = log[1].needed_accessories();
    assert_eq!(needed, set(&[Accessory::Umbrella]));
    assert!(unknown.is_empty());

    assert_eq!(service.evaluations(), 1);
    assert_eq!(
        service.last_metrics().and_then(|m| m.precipitation),
        Some("90".to_string())
    );
}

struct FailingSource;

#[async_trait]
impl WeatherSource for FailingSource {
    async fn fetch(&self) -> Result<WeatherMetrics, WeatherError> {
        Err(WeatherError::Fetch("forecast service unreachable".to_string()))
    }
}

#[tokio::test]
async fn test_fetch_failure_publishes_nothing() {
    let bus = Arc::new(EventBus::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    record_kinds(&bus, &log, EventKind::AccessoriesNeeded);

    let service = WeatherService::new(
        Arc::clone(&bus),
        Arc::new(FailingSource),
        WeatherThresholds::default(),
    );

    let err = service.refresh().await.unwrap_err();
    assert!(matches!(err, WeatherError::Fetch(_)));
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(service.evaluations(), 0);
}

#[tokio::test]
async fn test_failing_weather_subscriber_still_delivers_needs() {
    let bus = Arc::new(EventBus::new());
    bus.subscribe(
        EventKind::WeatherUpdated,
        handler_fn("dashboard", |_event| async {
            Err::<(), HandlerError>("render failed".into())
        }),
    );
    let log = Arc::new(Mutex::new(Vec::new()));
    record_kinds(&bus, &log, EventKind::AccessoriesNeeded);

    let service = WeatherService::new(
        Arc::clone(&bus),
        Arc::new(StaticWeatherSource::new(metrics("25", "80", "1", "보통"))),
        WeatherThresholds::default(),
    );

    // The dashboard failure is still reported to the caller
    let err = service.refresh().await.unwrap_err();
    assert!(matches!(err, WeatherError::Dispatch(_)));

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    let (needed, _) = log[0].needed_accessories();
    assert_eq!(needed, set(&[Accessory::Umbrella]));
    assert_eq!(service.evaluations(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_refresh_waits_one_interval() {
    let bus = Arc::new(EventBus::new());
    let service = Arc::new(WeatherService::new(
        Arc::clone(&bus),
        Arc::new(StaticWeatherSource::new(metrics("25", "0", "1", "보통"))),
        WeatherThresholds::default(),
    ));

    let task = tokio::spawn(Arc::clone(&service).run(Duration::from_secs(60)));

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(service.evaluations(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(service.evaluations(), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(service.evaluations(), 2);

    task.abort();
}
