//! Property tests across the chunk plan, reassembly and the job store.

use chunkwire_core::client::{JobStatus, JobStore, merge_chunks};
use chunkwire_files::chunker::{ChunkSizing, plan_chunks};
use chunkwire_files::hasher::{checksums_match, data_checksum, file_checksum};
use proptest::prelude::*;
use std::fs;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum JobOp {
    Claim,
    Done(usize),
    Failed(usize),
    Reset(usize),
    Register { adopt: bool },
}

fn job_op() -> impl Strategy<Value = JobOp> {
    prop_oneof![
        Just(JobOp::Claim),
        (0usize..4).prop_map(JobOp::Done),
        (0usize..4).prop_map(JobOp::Failed),
        (0usize..4).prop_map(JobOp::Reset),
        any::<bool>().prop_map(|adopt| JobOp::Register { adopt }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_count_plan_tiles_file(size in 1u64..5_000_000, count in 1u32..64) {
        let plan = plan_chunks("f", size, ChunkSizing::Count(count)).unwrap();
        prop_assert_eq!(plan.len() as u64, u64::from(count).min(size));

        let mut offset = 0;
        for (i, spec) in plan.iter().enumerate() {
            prop_assert_eq!(spec.sequence as usize, i);
            prop_assert_eq!(spec.start, offset);
            prop_assert!(spec.length > 0);
            offset = spec.end();
        }
        prop_assert_eq!(offset, size);
    }

    #[test]
    fn prop_reassembly_ignores_completion_order(
        data in proptest::collection::vec(any::<u8>(), 1..20_000),
        chunk in 64u64..4_000,
        seed in any::<u64>(),
    ) {
        let plan = plan_chunks("f", data.len() as u64, ChunkSizing::Fixed(chunk)).unwrap();
        let mut pieces: Vec<(u32, Vec<u8>)> = plan
            .iter()
            .map(|s| (s.sequence, data[s.start as usize..s.end() as usize].to_vec()))
            .collect();

        // Deterministic shuffle driven by the seed.
        let mut state = seed | 1;
        for i in (1..pieces.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            pieces.swap(i, (state % (i as u64 + 1)) as usize);
        }

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.part");
        merge_chunks(&path, data.len() as u64, &plan, pieces).unwrap();

        prop_assert!(checksums_match(&file_checksum(&path).unwrap(), &data_checksum(&data)));
        prop_assert_eq!(fs::read(&path).unwrap(), data);
    }

    #[test]
    fn prop_terminal_jobs_only_leave_through_reset(
        ops in proptest::collection::vec(job_op(), 1..40),
    ) {
        let names = ["a", "b", "c", "d"];
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path().join("jobs.txt")).unwrap();
        store.enqueue(names).unwrap();

        for op in ops {
            let before = store.entries().unwrap();
            match &op {
                JobOp::Claim => {
                    store.claim_pending().unwrap();
                }
                JobOp::Done(i) => {
                    store.mark(names[*i], JobStatus::Done).unwrap();
                }
                JobOp::Failed(i) => {
                    store.mark(names[*i], JobStatus::Failed).unwrap();
                }
                JobOp::Reset(i) => {
                    store.reset(names[*i]).unwrap();
                }
                JobOp::Register { adopt } => {
                    let (_lease, adopted) = store.register(*adopt).unwrap();
                    let interrupted: Vec<String> = before
                        .iter()
                        .filter(|e| e.status == JobStatus::InProgress)
                        .map(|e| e.name.clone())
                        .collect();
                    if *adopt {
                        prop_assert_eq!(adopted, interrupted);
                    } else {
                        prop_assert!(adopted.is_empty());
                    }
                }
            }
            let after = store.entries().unwrap();
            prop_assert_eq!(after.len(), names.len());

            for (old, new) in before.iter().zip(&after) {
                prop_assert_eq!(&old.name, &new.name);
                let reset_here = matches!(&op, JobOp::Reset(i) if names[*i] == old.name);
                if old.status.is_terminal() && !reset_here {
                    prop_assert_eq!(old.status, new.status);
                }
                if new.status == JobStatus::Pending && old.status != JobStatus::Pending {
                    prop_assert!(reset_here);
                }
                if matches!(op, JobOp::Register { .. }) {
                    prop_assert_eq!(old.status, new.status);
                }
            }
        }
    }
}
