//! Process-wide logging and metrics handles, following the convention set by the reference
//! `busyrpc` crate: one static [indicio::Collector] for structured logging, and a
//! `register_biometrics` function each module contributes its counters to.

/// The collector every `clue!` call in this crate and [crate::node] logs through.
pub static LOGGING: indicio::Collector = indicio::Collector::new();

/// Registers every counter this crate defines with `collector`.  Call once at process startup,
/// before wiring a [biometrics::Collector] to an emitter.
pub fn register_biometrics(collector: &biometrics::Collector) {
    crate::dispatcher::register_biometrics(collector);
    crate::net::register_biometrics(collector);
    crate::abstractions::register_biometrics(collector);
}

/// Registers every [tatl::HeyListen] monitor this crate defines. Call once at process startup and
/// evaluate `hey_listen` periodically (see `consensus-node`'s biometrics thread) to surface
/// conditions that should never occur in a healthy run.
pub fn register_monitors(hey_listen: &mut tatl::HeyListen) {
    crate::dispatcher::register_monitors(hey_listen);
}
