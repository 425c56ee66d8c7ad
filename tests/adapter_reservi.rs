// tests/adapter_reservi.rs
use slotwatch::sources::reservi::{ReserviAdapter, POOLS};
use slotwatch::sources::SourceAdapter;

fn chaika_adapter() -> ReserviAdapter {
    let raw = include_str!("fixtures/reservi_calendar.json");
    ReserviAdapter::from_fixture(&POOLS[0], raw)
}

#[tokio::test]
async fn fixture_parses_filters_and_sorts() {
    let snapshot = chaika_adapter().fetch().await.unwrap();
    let identities: Vec<&str> = snapshot.iter().map(|e| e.identity.as_str()).collect();
    // The other-training row is filtered, the row without occupancy text and
    // the row with broken options are skipped, and the rest sort by start.
    assert_eq!(
        identities,
        vec![
            "ad66550f-cb3f-11ea-bbd3-0050568342b3/2026-09-01 18:30:00/Olga O'Neil/t8/f1",
            "ad66550f-cb3f-11ea-bbd3-0050568342b3/2026-09-07 10:00:00/Ivan Petrov/t10/f3",
            "ad66550f-cb3f-11ea-bbd3-0050568342b3/2026-09-10 09:00:00//t6/f2",
        ]
    );
}

#[tokio::test]
async fn fixture_payloads_carry_slot_fields() {
    let snapshot = chaika_adapter().fetch().await.unwrap();
    let first = &snapshot[0].payload;
    assert_eq!(first["trainer"], "Olga O'Neil");
    assert_eq!(first["starts_at"], "2026-09-01 18:30:00");
    assert_eq!(first["free"], 1);
    assert_eq!(first["total"], 8);
}

#[tokio::test]
async fn unknown_trainer_keeps_slot_with_empty_name() {
    let snapshot = chaika_adapter().fetch().await.unwrap();
    let last = &snapshot[2].payload;
    assert_eq!(last["trainer"], "");
    assert_eq!(last["free"], 2);
}

#[tokio::test]
async fn message_formats_header_and_blocks() {
    let adapter = chaika_adapter();
    let snapshot = adapter.fetch().await.unwrap();
    let text = adapter.render_message(&snapshot);
    assert!(text.starts_with("*Чайка*\n"));
    assert!(text.contains("_Tuesday, September 1, 2026_\nOlga O'Neil\nFree *1 of 8*\n"));
    assert!(text.contains("_Monday, September 7, 2026_\nIvan Petrov\nFree *3 of 10*\n"));
}

#[tokio::test]
async fn empty_diff_renders_header_only() {
    let adapter = chaika_adapter();
    assert_eq!(adapter.render_message(&vec![]), "*Чайка*\n");
}

#[tokio::test]
async fn malformed_body_is_an_error() {
    let adapter = ReserviAdapter::from_fixture(&POOLS[0], "not json");
    assert!(adapter.fetch().await.is_err());
}
