//! Store behaviour every `MessageStore` backend must share.

use eventfold_decider::{
    EventData, ExpectedVersion, MessageStore, StreamId, StreamName, WriteResult,
};

fn stream(category: &str, id: &str) -> StreamName {
    StreamName::new(category, StreamId::new(id).expect("valid id")).expect("valid stream")
}

/// An empty append writes nothing but still answers to the expected version.
pub async fn empty_append_honours_expected_version(store: &dyn MessageStore, category: &str) {
    let missing = stream(category, "missing");
    for expected in [ExpectedVersion::Any, ExpectedVersion::NoStream] {
        let result = store
            .write_messages(&missing, Vec::new(), expected)
            .await
            .expect("write");
        assert_eq!(result, WriteResult::Written(-1), "{expected:?} on a missing stream");
    }
    let result = store
        .write_messages(&missing, Vec::new(), ExpectedVersion::Exact(0))
        .await
        .expect("write");
    assert_eq!(result, WriteResult::Conflict);

    let existing = stream(category, "existing");
    store
        .write_messages(
            &existing,
            vec![EventData::new("Raised"), EventData::new("Paid")],
            ExpectedVersion::NoStream,
        )
        .await
        .expect("write");

    let cases = [
        (ExpectedVersion::Any, WriteResult::Written(1)),
        (ExpectedVersion::Exact(1), WriteResult::Written(1)),
        (ExpectedVersion::Exact(0), WriteResult::Conflict),
        (ExpectedVersion::NoStream, WriteResult::Conflict),
    ];
    for (expected, outcome) in cases {
        let result = store
            .write_messages(&existing, Vec::new(), expected)
            .await
            .expect("write");
        assert_eq!(result, outcome, "{expected:?} on a stream at version 1");
    }

    let events = store.read_stream(&existing, 0, 10, true).await.expect("read");
    assert_eq!(events.len(), 2);
}
