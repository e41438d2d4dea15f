use rand::seq::SliceRandom;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "cosmic", "crisp", "daring", "eager", "fancy",
    "gentle", "golden", "happy", "hidden", "jolly", "keen", "lively", "lucky", "mellow", "misty",
    "nimble", "noble", "plucky", "proud", "quiet", "rapid", "rustic", "silent", "steady", "sunny",
    "swift", "tidy", "vivid", "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "canyon", "comet", "falcon", "fern", "glacier", "harbor", "heron", "island",
    "lantern", "maple", "meadow", "otter", "panda", "pebble", "pine", "quartz", "raven", "reef",
    "river", "sparrow", "spruce", "summit", "thistle", "tiger", "tundra", "walrus", "willow", "yak",
];

/// Human-friendly `adjective_noun` label. Not unique.
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("lone");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("stream");
    format!("{adjective}_{noun}")
}
