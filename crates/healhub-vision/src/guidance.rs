//! Treatment suggestions and referral specialization per label

use serde::{Deserialize, Serialize};

/// Guidance attached to a resolved label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guidance {
    pub treatments: Vec<String>,
    pub specialization: String,
}

const DEFAULT_TREATMENTS: &[&str] = &["Visit a clinician for diagnosis"];
const DEFAULT_SPECIALIZATION: &str = "General";

const TABLE: &[(&str, &[&str], &str)] = &[
    (
        "Acne",
        &["Topical benzoyl peroxide", "Topical retinoids", "Keep area clean"],
        "Dermatology",
    ),
    (
        "Eczema",
        &["Topical corticosteroids", "Moisturizers", "Avoid irritants"],
        "Dermatology",
    ),
    (
        "Diabetic Foot Ulcer",
        &["Wound debridement", "Antibiotics if infected", "Offloading and dressings"],
        "Wound Care",
    ),
    (
        "Fungal Infection",
        &["Topical antifungals", "Keep area dry"],
        "Dermatology",
    ),
];

/// Look up guidance for a label; unknown labels get the general referral
pub fn guidance_for(label: &str) -> Guidance {
    let (treatments, specialization) = TABLE
        .iter()
        .find(|(name, _, _)| *name == label)
        .map(|(_, treatments, spec)| (*treatments, *spec))
        .unwrap_or((DEFAULT_TREATMENTS, DEFAULT_SPECIALIZATION));

    Guidance {
        treatments: treatments.iter().map(|t| t.to_string()).collect(),
        specialization: specialization.to_string(),
    }
}
