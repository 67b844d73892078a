// Edge-case tests for the task store
// Run with: cargo test --lib database::tests

#[cfg(test)]
mod task_tests {
    use crate::database::{Database, ResultRef, TaskStatus};
    use tempfile::TempDir;

    fn setup_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path).unwrap();
        (db, temp_dir)
    }

    fn result_ref(id: i64) -> ResultRef {
        ResultRef {
            id,
            access_token: format!("token-{}", id),
        }
    }

    // =========================================================================
    // Creation
    // =========================================================================

    #[test]
    fn test_create_task_starts_processing_at_zero() {
        let (db, _temp) = setup_test_db();
        let id = db.create_task(1, "lecture.txt").unwrap();
        assert!(id > 0);

        let task = db.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.progress, 0);
        assert_eq!(task.owner_id, 1);
        assert_eq!(task.filename, "lecture.txt");
        assert!(task.result.is_none());
    }

    #[test]
    fn test_task_ids_are_monotonic() {
        let (db, _temp) = setup_test_db();
        let a = db.create_task(1, "a.txt").unwrap();
        let b = db.create_task(2, "b.txt").unwrap();
        let c = db.create_task(1, "c.txt").unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_ids_not_reused_after_delete() {
        let (db, _temp) = setup_test_db();
        let a = db.create_task(1, "a.txt").unwrap();
        db.mark_failed(a, "boom").unwrap();
        {
            let conn = db.conn().unwrap();
            conn.execute("DELETE FROM analysis_tasks", []).unwrap();
        }
        let b = db.create_task(1, "b.txt").unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_get_task_for_owner_scopes_by_owner() {
        let (db, _temp) = setup_test_db();
        let id = db.create_task(1, "mine.txt").unwrap();
        assert!(db.get_task_for_owner(id, 1).unwrap().is_some());
        assert!(db.get_task_for_owner(id, 2).unwrap().is_none());
    }

    #[test]
    fn test_unknown_task_has_no_status() {
        let (db, _temp) = setup_test_db();
        assert!(db.get_status(999).unwrap().is_none());
        assert!(db.get_task(999).unwrap().is_none());
    }

    // =========================================================================
    // Progress
    // =========================================================================

    #[test]
    fn test_progress_never_decreases() {
        let (db, _temp) = setup_test_db();
        let id = db.create_task(1, "a.txt").unwrap();
        db.update_progress(id, 40, "topics", "clustering").unwrap();
        db.update_progress(id, 20, "topics", "late update").unwrap();

        let task = db.get_task(id).unwrap().unwrap();
        assert_eq!(task.progress, 40);
        assert_eq!(task.stage_details, "late update");
    }

    #[test]
    fn test_progress_is_clamped() {
        let (db, _temp) = setup_test_db();
        let id = db.create_task(1, "a.txt").unwrap();
        db.update_progress(id, 250, "summary", "").unwrap();
        assert_eq!(db.get_task(id).unwrap().unwrap().progress, 100);
    }

    #[test]
    fn test_progress_ignored_after_terminal() {
        let (db, _temp) = setup_test_db();
        let id = db.create_task(1, "a.txt").unwrap();
        db.update_progress(id, 30, "extracting", "").unwrap();
        assert!(db.cancel_task(id, 1).unwrap());

        let touched = db.update_progress(id, 90, "flashcards", "").unwrap();
        assert_eq!(touched, 0);
        let task = db.get_task(id).unwrap().unwrap();
        assert_eq!(task.progress, 30);
        assert_eq!(task.current_stage, "extracting");
    }

    // =========================================================================
    // Terminal transitions
    // =========================================================================

    #[test]
    fn test_cancel_unknown_task_returns_false() {
        let (db, _temp) = setup_test_db();
        assert!(!db.cancel_task(42, 1).unwrap());
    }

    #[test]
    fn test_cancel_wrong_owner_returns_false() {
        let (db, _temp) = setup_test_db();
        let id = db.create_task(1, "a.txt").unwrap();
        assert!(!db.cancel_task(id, 2).unwrap());
        assert_eq!(db.get_status(id).unwrap(), Some(TaskStatus::Processing));
    }

    #[test]
    fn test_cancel_twice_second_is_false() {
        let (db, _temp) = setup_test_db();
        let id = db.create_task(1, "a.txt").unwrap();
        assert!(db.cancel_task(id, 1).unwrap());
        assert!(!db.cancel_task(id, 1).unwrap());

        let task = db.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.cancelled_at.is_some());
    }

    #[test]
    fn test_complete_after_cancel_is_rejected() {
        let (db, _temp) = setup_test_db();
        let id = db.create_task(1, "a.txt").unwrap();
        assert!(db.cancel_task(id, 1).unwrap());
        assert!(!db.mark_completed(id, &result_ref(5)).unwrap());

        let task = db.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.result.is_none());
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let (db, _temp) = setup_test_db();

        let completed = db.create_task(1, "a.txt").unwrap();
        assert!(db.mark_completed(completed, &result_ref(1)).unwrap());
        assert!(!db.mark_failed(completed, "late").unwrap());
        assert!(!db.cancel_task(completed, 1).unwrap());
        assert!(!db.mark_cancelled(completed).unwrap());

        let failed = db.create_task(1, "b.txt").unwrap();
        assert!(db.mark_failed(failed, "boom").unwrap());
        assert!(!db.mark_completed(failed, &result_ref(2)).unwrap());
        assert!(!db.cancel_task(failed, 1).unwrap());

        assert_eq!(db.get_status(completed).unwrap(), Some(TaskStatus::Completed));
        assert_eq!(db.get_status(failed).unwrap(), Some(TaskStatus::Failed));
    }

    #[test]
    fn test_mark_completed_sets_result_and_full_progress() {
        let (db, _temp) = setup_test_db();
        let id = db.create_task(1, "a.txt").unwrap();
        assert!(db.mark_completed(id, &result_ref(9)).unwrap());

        let task = db.get_task(id).unwrap().unwrap();
        assert_eq!(task.progress, 100);
        assert_eq!(task.result, Some(result_ref(9)));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_mark_failed_keeps_error_detail() {
        let (db, _temp) = setup_test_db();
        let id = db.create_task(1, "a.txt").unwrap();
        db.mark_failed(id, "summary backend returned 401").unwrap();

        let task = db.get_task(id).unwrap().unwrap();
        assert_eq!(
            task.error_message.as_deref(),
            Some("summary backend returned 401")
        );
        assert_eq!(task.user_message(), "Processing failed, please retry");
    }

    // =========================================================================
    // Housekeeping
    // =========================================================================

    #[test]
    fn test_fail_interrupted_tasks_only_touches_processing() {
        let (db, _temp) = setup_test_db();
        let stuck = db.create_task(1, "a.txt").unwrap();
        let done = db.create_task(1, "b.txt").unwrap();
        db.mark_completed(done, &result_ref(1)).unwrap();

        assert_eq!(db.fail_interrupted_tasks().unwrap(), 1);
        assert_eq!(db.get_status(stuck).unwrap(), Some(TaskStatus::Failed));
        assert_eq!(db.get_status(done).unwrap(), Some(TaskStatus::Completed));
    }

    #[test]
    fn test_delete_old_tasks_keeps_processing_and_recent() {
        let (db, _temp) = setup_test_db();
        let old_done = db.create_task(1, "old.txt").unwrap();
        db.mark_failed(old_done, "x").unwrap();
        let old_running = db.create_task(1, "running.txt").unwrap();
        let recent = db.create_task(1, "new.txt").unwrap();
        db.mark_failed(recent, "x").unwrap();
        {
            let conn = db.conn().unwrap();
            conn.execute(
                "UPDATE analysis_tasks SET created_at = datetime('now', '-30 days') WHERE id IN (?, ?)",
                rusqlite::params![old_done, old_running],
            )
            .unwrap();
        }

        assert_eq!(db.delete_old_tasks(7).unwrap(), 1);
        assert!(db.get_task(old_done).unwrap().is_none());
        assert!(db.get_task(old_running).unwrap().is_some());
        assert!(db.get_task(recent).unwrap().is_some());
    }

    #[test]
    fn test_active_source_files() {
        let (db, _temp) = setup_test_db();
        let a = db.create_task(1, "a.txt").unwrap();
        let b = db.create_task(1, "b.txt").unwrap();
        db.set_source_file(a, "/uploads/a.txt").unwrap();
        db.set_source_file(b, "/uploads/b.txt").unwrap();
        db.mark_failed(b, "x").unwrap();

        assert_eq!(db.active_source_files().unwrap(), vec!["/uploads/a.txt".to_string()]);
    }

    #[test]
    fn test_count_tasks_by_status() {
        let (db, _temp) = setup_test_db();
        db.create_task(1, "a.txt").unwrap();
        let b = db.create_task(1, "b.txt").unwrap();
        db.cancel_task(b, 1).unwrap();

        let counts = db.count_tasks().unwrap();
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.cancelled, 1);
        assert_eq!(counts.completed, 0);
    }

    #[test]
    fn test_list_tasks_filters_by_owner() {
        let (db, _temp) = setup_test_db();
        db.create_task(1, "a.txt").unwrap();
        db.create_task(2, "b.txt").unwrap();
        db.create_task(1, "c.txt").unwrap();

        assert_eq!(db.list_tasks(Some(1), 10).unwrap().len(), 2);
        assert_eq!(db.list_tasks(None, 10).unwrap().len(), 3);
        // Newest first
        assert_eq!(db.list_tasks(None, 1).unwrap()[0].filename, "c.txt");
    }

    #[test]
    fn test_update_filename() {
        let (db, _temp) = setup_test_db();
        let id = db.create_task(1, "video_from_url").unwrap();
        db.update_filename(id, "Intro to Rust.mp4").unwrap();
        assert_eq!(db.get_task(id).unwrap().unwrap().filename, "Intro to Rust.mp4");
    }

    // =========================================================================
    // Results
    // =========================================================================

    #[test]
    fn test_insert_and_delete_result() {
        let (db, _temp) = setup_test_db();
        let task = db.create_task(1, "a.txt").unwrap();
        let r = db
            .insert_result(1, task, "a.txt", ".txt", "{}", Some(r#"{"page_range":"1-3"}"#))
            .unwrap();
        assert!(!r.access_token.is_empty());

        let stored = db.get_result_by_token(&r.access_token).unwrap().unwrap();
        assert_eq!(stored.task_id, task);
        assert_eq!(stored.file_type, ".txt");
        assert_eq!(db.count_results_for_task(task).unwrap(), 1);

        assert_eq!(db.delete_result(r.id).unwrap(), 1);
        assert_eq!(db.count_results_for_task(task).unwrap(), 0);
        assert_eq!(db.delete_result(r.id).unwrap(), 0);
    }
}
