use shelter_adapters::{DatasetSource, FixtureDatasetSource};
use shelter_core::{latest_import, parse_area, parse_capacity, Disaster, ShelterRecord};

fn fixture_path() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/taipei-shelters/sample/page.json")
}

#[tokio::test]
async fn captured_page_parses_into_typed_records() {
    let source = FixtureDatasetSource::from_path(fixture_path())
        .await
        .expect("fixture loads");
    let page = source.fetch_page(1000, 0).await.expect("page");

    assert_eq!(page.total_count, Some(5));
    assert_eq!(page.records.len(), 5);
    assert!(page.records.iter().all(|r| r.shelter_code.is_some()));
    assert_eq!(
        latest_import(&page.records).map(|t| t.to_string()).as_deref(),
        Some("2024-03-01 10:00:00")
    );

    let located = page.records.iter().filter(|r| r.location.is_some()).count();
    assert_eq!(located, 1);

    let rebuilding = &page.records[1];
    assert_eq!(parse_area(&rebuilding.area), 0.0);
    assert_eq!(parse_capacity(&rebuilding.capacity), 850);

    let negative = &page.records[4];
    assert_eq!(parse_capacity(&negative.capacity), 0);
    assert!(negative.address.is_empty());
}

#[tokio::test]
async fn captured_rows_convert_to_shelters() {
    let source = FixtureDatasetSource::from_path(fixture_path())
        .await
        .expect("fixture loads");
    let shelters = source
        .records()
        .iter()
        .map(|r| ShelterRecord::from_source(r, r.location))
        .collect::<Result<Vec<_>, _>>()
        .expect("all rows carry codes");

    let yangming = shelters
        .iter()
        .find(|s| s.shelter_code == "A0301")
        .expect("A0301 present");
    assert_eq!(yangming.disasters, vec![Disaster::Earthquake, Disaster::Landslide]);
    assert!(yangming.is_query_eligible());
    assert!(yangming.indoor && yangming.outdoor);

    let xinyi = &shelters[0];
    assert_eq!(xinyi.capacity, 1200);
    assert_eq!(xinyi.area_m2, 4800.0);
    assert!(xinyi.relief_station);
    assert_eq!(xinyi.memo, None);
}
