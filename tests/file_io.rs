/*!
Test CSV tick IO
*/
use std::io::{Seek, SeekFrom};
use stockcast::data::{fake::*, file::*, *};
use tempfile::tempfile;

#[test]
fn fake_data_roundtrip() {
    const TEST_DATA_LENGTH: usize = 10000;
    let ticks: Vec<Tick> = random_walk_ticks(42).take(TEST_DATA_LENGTH).collect();
    let mut tmp = tempfile().expect("Tempfile creation should not fail!");
    let written =
        write_ticks(&mut tmp, ticks.iter().copied()).expect("Writing test data should not fail!");
    assert_eq!(written, TEST_DATA_LENGTH);
    tmp.seek(SeekFrom::Start(0)).expect("Seek should not fail");
    let read_ticks = read_ticks(&mut tmp, None).expect("Reading test data should not fail");
    assert_eq!(ticks, read_ticks);
}

#[tokio::test]
async fn file_provider_serves_stored_ticks() {
    let dir = tempfile::tempdir().expect("Tempdir creation should not fail!");
    let provider = FileProvider::new(dir.path());
    let mut ticks: Vec<Tick> = random_walk_ticks(43).take(200).collect();
    // Stored out of order, with a duplicate timestamp
    ticks.swap(3, 150);
    ticks.push(ticks[10]);
    provider
        .store("AAPL", Interval::Min5, &ticks)
        .expect("Storing ticks should not fail");

    let served = provider
        .fetch_intraday("AAPL", Interval::Min5)
        .await
        .expect("Fetching stored ticks should not fail");
    assert_eq!(served.len(), 200);
    assert!(served.windows(2).all(|pair| pair[0].t < pair[1].t));
    assert_eq!(served, normalize_ticks(ticks));

    let missing = provider.fetch_intraday("MSFT", Interval::Min5).await;
    assert!(matches!(
        missing,
        Err(stockcast::error::ProviderError::InvalidSymbol(_))
    ));
}
