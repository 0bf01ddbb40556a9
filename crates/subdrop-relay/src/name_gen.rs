//! Word-pair device name generator.
//!
//! Used when a connecting client doesn't announce a saved display name.

use rand::seq::SliceRandom;

const ADJECTIVES: [&str; 8] = [
    "Quick", "Silent", "Bright", "Swift", "Gentle", "Bold", "Calm", "Smart",
];

const ANIMALS: [&str; 8] = [
    "Fox", "Wolf", "Eagle", "Lion", "Tiger", "Bear", "Hawk", "Deer",
];

/// Generate a random "Adjective Animal" display name.
pub fn random_device_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).expect("non-empty list");
    let animal = ANIMALS.choose(&mut rng).expect("non-empty list");
    format!("{adjective} {animal}")
}
