//! §4.4: produce the list of permutations to run, either by enumerating
//! every legal interleaving or by resolving the spec's named list.

use crate::spec::{StepRef, TestSpec};

/// Every sequence that, restricted to each session, preserves that
/// session's step order, realised with a per-session cursor ("pile") and
/// recursive choice, emitted in the lexicographic order induced by session
/// index at each choice point (§4.4) so the result is stable across runs.
pub fn enumerate_all(spec: &TestSpec) -> Vec<Vec<StepRef>> {
    let mut piles = vec![0usize; spec.sessions.len()];
    let mut current = Vec::new();
    let mut results = Vec::new();
    recurse(spec, &mut piles, &mut current, &mut results);
    results
}

fn recurse(
    spec: &TestSpec,
    piles: &mut [usize],
    current: &mut Vec<StepRef>,
    results: &mut Vec<Vec<StepRef>>,
) {
    let mut advanced = false;
    for session_idx in 0..spec.sessions.len() {
        if piles[session_idx] < spec.sessions[session_idx].steps.len() {
            advanced = true;
            current.push((session_idx, piles[session_idx]));
            piles[session_idx] += 1;
            recurse(spec, piles, current, results);
            piles[session_idx] -= 1;
            current.pop();
        }
    }
    if !advanced {
        results.push(current.clone());
    }
}

/// Resolve the spec's named permutations against the global step table. An
/// undefined step name is fatal (§4.4).
pub fn resolve_named(spec: &TestSpec) -> anyhow::Result<Vec<Vec<StepRef>>> {
    let table = spec.step_table();
    spec.permutations
        .iter()
        .map(|perm| {
            perm.steps
                .iter()
                .map(|name| TestSpec::resolve_step(&table, name))
                .collect::<anyhow::Result<Vec<_>>>()
        })
        .collect()
}

/// The set of permutations the driver will run: named, if the spec declares
/// any, else every legal interleaving.
pub fn resolve_permutations(spec: &TestSpec) -> anyhow::Result<Vec<Vec<StepRef>>> {
    if spec.permutations.is_empty() {
        Ok(enumerate_all(spec))
    } else {
        resolve_named(spec)
    }
}

/// Render a permutation in spec-file syntax for `-n` dry-run output:
/// `permutation "a" "b" …`.
pub fn format_dry_run_line(spec: &TestSpec, permutation: &[StepRef]) -> String {
    let mut line = String::from("permutation");
    for step_ref in permutation {
        line.push_str(" \"");
        line.push_str(&spec.step(*step_ref).name);
        line.push('"');
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec_format::parse;

    fn two_sessions_two_steps() -> TestSpec {
        parse(
            r#"
            session "a"
            step "a1" { SELECT 1; }
            step "a2" { SELECT 2; }

            session "b"
            step "b1" { SELECT 3; }
            step "b2" { SELECT 4; }
        "#,
        )
        .unwrap()
    }

    #[test]
    fn enumerates_every_legal_interleaving_exactly_once() {
        let spec = two_sessions_two_steps();
        let perms = enumerate_all(&spec);
        assert_eq!(perms.len(), 6);

        let names: Vec<Vec<&str>> = perms
            .iter()
            .map(|p| p.iter().map(|r| spec.step(*r).name.as_str()).collect())
            .collect();

        let mut unique = names.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 6, "no two permutations may be equal as sequences");

        for seq in &names {
            let a: Vec<_> = seq.iter().copied().filter(|n| n.starts_with('a')).collect();
            let b: Vec<_> = seq.iter().copied().filter(|n| n.starts_with('b')).collect();
            assert_eq!(a, vec!["a1", "a2"]);
            assert_eq!(b, vec!["b1", "b2"]);
        }
    }

    #[test]
    fn first_permutation_is_lexicographically_first_by_session_index() {
        let spec = two_sessions_two_steps();
        let perms = enumerate_all(&spec);
        let first: Vec<&str> = perms[0].iter().map(|r| spec.step(*r).name.as_str()).collect();
        assert_eq!(first, vec!["a1", "a2", "b1", "b2"]);
    }

    #[test]
    fn named_permutations_resolve_in_declared_order() {
        let spec = parse(
            r#"
            session "a"
            step "a1" { SELECT 1; }
            session "b"
            step "b1" { SELECT 2; }

            permutation "b1" "a1"
        "#,
        )
        .unwrap();
        let perms = resolve_permutations(&spec).unwrap();
        assert_eq!(perms.len(), 1);
        let names: Vec<&str> = perms[0].iter().map(|r| spec.step(*r).name.as_str()).collect();
        assert_eq!(names, vec!["b1", "a1"]);
    }

    #[test]
    fn undefined_step_name_in_a_permutation_is_fatal() {
        let spec = parse(
            r#"
            session "a"
            step "a1" { SELECT 1; }
            permutation "nope"
        "#,
        )
        .unwrap();
        assert!(resolve_permutations(&spec).is_err());
    }

    #[test]
    fn dry_run_line_matches_spec_file_syntax() {
        let spec = two_sessions_two_steps();
        let perm = &enumerate_all(&spec)[0];
        assert_eq!(
            format_dry_run_line(&spec, perm),
            r#"permutation "a1" "a2" "b1" "b2""#
        );
    }
}
