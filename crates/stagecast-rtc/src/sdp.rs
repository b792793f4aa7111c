//! SDP helpers.

/// Build a stand-in answer from a local offer: every `a=sendrecv` line
/// becomes `a=recvonly`. All other lines, and every line ending, are kept
/// byte for byte.
pub fn synthesize_answer(offer: &str) -> String {
    let mut answer = String::with_capacity(offer.len());
    for line in offer.split_inclusive('\n') {
        let body = line.trim_end_matches(['\r', '\n']);
        if body == "a=sendrecv" {
            answer.push_str("a=recvonly");
            answer.push_str(&line[body.len()..]);
        } else {
            answer.push_str(line);
        }
    }
    answer
}
