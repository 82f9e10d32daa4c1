//! Save, preview and revert against a live session.

use collab_core::EditorSession;
use collab_core::error::CollabError;
use collab_core::model::{Operation, Position};
use collab_core::test_utils::{HubPeer, LoopbackHub, test_editor};
use collab_core::versions::PreviewOutcome;
use futures_lite::future::block_on;

fn online(editor: &EditorSession, hub: &mut LoopbackHub) {
    editor
        .with_session(|s| {
            s.begin_connect();
            s.on_open();
        })
        .unwrap();
    pump(editor, hub);
}

fn pump(editor: &EditorSession, hub: &mut LoopbackHub) {
    let mut peer = editor;
    hub.pump(&mut [&mut peer as &mut dyn HubPeer]);
}

fn type_text(editor: &EditorSession, hub: &mut LoopbackHub, offset: usize, text: &str) {
    editor
        .apply(&[Operation::insert_text(Position::new(vec![1], offset), text)])
        .unwrap();
    pump(editor, hub);
}

#[test]
fn test_draft_scenario() {
    let editor = test_editor("u1");
    let mut hub = LoopbackHub::new();
    online(&editor, &mut hub);

    block_on(async {
        let draft1 = editor.save_version(Some("draft 1".into())).await.unwrap();
        assert_eq!(draft1.version, 1);

        type_text(&editor, &mut hub, 0, "one ");
        type_text(&editor, &mut hub, 4, "two ");
        type_text(&editor, &mut hub, 8, "three");

        let draft2 = editor.save_version(Some("draft 2".into())).await.unwrap();
        assert_eq!(draft2.version, 2);
        let live = editor.document().unwrap();
        assert!(live.plain_text().contains("one two three"));

        // Preview is read-only and does not show the later edits.
        let PreviewOutcome::Ready(snapshot) = editor.preview_version(1).await.unwrap() else {
            panic!("preview of version 1 should be ready");
        };
        assert!(!snapshot.content.plain_text().contains("one"));
        assert_eq!(editor.document().unwrap(), live);
        editor.close_preview().unwrap();

        let log_before = editor.with_session(|s| s.replica().log_len()).unwrap();
        let request = editor.request_revert(1).await.unwrap();
        let outcome = editor.revert_to_version(request.confirm()).await.unwrap();
        pump(&editor, &mut hub);

        assert!(outcome.backup.is_none());
        assert!(outcome.applied > 0);
        assert_eq!(
            outcome.saved.as_ref().and_then(|v| v.name.as_deref()),
            Some("Revert to version 1")
        );
        assert_eq!(editor.document().unwrap(), snapshot.content);
        assert_eq!(hub.replica.document(), snapshot.content);
        let log_after = editor.with_session(|s| s.replica().log_len()).unwrap();
        assert!(log_after > log_before);

        let names: Vec<_> = editor
            .list_versions()
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.name.unwrap_or_default())
            .collect();
        assert_eq!(names, ["draft 1", "draft 2", "Revert to version 1"]);

        // The revert is an ordinary edit.
        assert!(editor.undo().unwrap());
        assert_eq!(editor.document().unwrap(), live);
    });
}

#[test]
fn test_revert_saves_unsaved_changes_first() {
    let editor = test_editor("u1");
    let mut hub = LoopbackHub::new();
    online(&editor, &mut hub);

    block_on(async {
        editor.save_version(None).await.unwrap();
        type_text(&editor, &mut hub, 0, "unsaved");

        let request = editor.request_revert(1).await.unwrap();
        let outcome = editor.revert_to_version(request.confirm()).await.unwrap();
        let backup = outcome.backup.unwrap();
        assert_eq!(backup.version, 2);
        assert_eq!(
            backup.name.as_deref(),
            Some("Unsaved changes before revert to version 1")
        );
        assert!(!editor.document().unwrap().plain_text().contains("unsaved"));
    });
}

#[test]
fn test_version_errors() {
    let editor = test_editor("u1");
    let mut hub = LoopbackHub::new();

    block_on(async {
        assert!(matches!(
            editor.save_version(None).await,
            Err(CollabError::NotConnected)
        ));

        online(&editor, &mut hub);
        editor.save_version(None).await.unwrap();
        assert!(matches!(
            editor.save_version(None).await,
            Err(CollabError::EmptyDocument {
                since_version: Some(1)
            })
        ));
        assert!(matches!(
            editor.request_revert(7).await,
            Err(CollabError::VersionNotFound(7))
        ));
    });
}
