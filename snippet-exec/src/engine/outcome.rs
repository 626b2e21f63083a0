use crate::module::Fault;
use crate::types::Outcome;

const PASS_KINDS: &[&str] = &[
    "passedsignal",
    "successsignal",
    "passsignal",
    "passedexception",
    "successexception",
    "passexception",
];
const IGNORE_KINDS: &[&str] = &["ignoresignal", "ignoreexception", "ignoredexception"];
const INCONCLUSIVE_KINDS: &[&str] = &["inconclusivesignal", "inconclusiveexception"];

/// Maps a fault raised by a test to its outcome.
///
/// Control signals are recognised by kind name, ignoring case and any
/// module path. Otherwise a message that starts with "passed" or "success"
/// still counts as a pass.
pub fn classify(fault: &Fault) -> Outcome {
    let kind = fault
        .kind
        .rsplit([':', '.'])
        .next()
        .unwrap_or(fault.kind.as_str())
        .to_ascii_lowercase();

    if PASS_KINDS.contains(&kind.as_str()) {
        return Outcome::Pass;
    }
    if IGNORE_KINDS.contains(&kind.as_str()) {
        return Outcome::Ignored;
    }
    if INCONCLUSIVE_KINDS.contains(&kind.as_str()) {
        return Outcome::Inconclusive;
    }

    let message = fault.message.trim_start().to_ascii_lowercase();
    if message.starts_with("passed") || message.starts_with("success") {
        return Outcome::Pass;
    }
    Outcome::Fail
}
