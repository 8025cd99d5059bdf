use cakeday_infra::WorkerSettings;

#[tokio::test]
async fn invalid_settings_fail_before_connecting() {
    let settings = WorkerSettings {
        database_url: "postgres://127.0.0.1:1/none".into(),
        batch_size: 0,
        ..WorkerSettings::default()
    };

    let err = cakeday_worker::app::run(settings, true, async {}).await.unwrap_err();
    assert!(format!("{err:#}").contains("WORKER_BATCH_SIZE"), "{err:#}");
}

#[tokio::test]
async fn unreachable_database_is_fatal() {
    let settings = WorkerSettings {
        database_url: "postgres://cakeday@127.0.0.1:1/none".into(),
        ..WorkerSettings::default()
    };

    let err = cakeday_worker::app::run(settings, true, async {}).await.unwrap_err();
    assert!(format!("{err:#}").contains("database"), "{err:#}");
}
