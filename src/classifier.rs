//! Maps provider place-type tokens onto the internal [`Category`] set.
//!
//! Matching is plain substring containment against [`CATEGORY_RULES`] in
//! declaration order. The first token that matches any rule decides the
//! category; unmatched input always resolves to [`Category::Other`].

use crate::models::Category;

/// Ordered `(substring, category)` rules. Longer keys that contain a shorter
/// key from another category ("кинотеатр" vs "театр", "аквапарк" vs "парк",
/// "кафедральный" vs "кафе") must be declared first.
pub const CATEGORY_RULES: &[(&str, Category)] = &[
    // Russian provider vocabulary
    ("кафедральн", Category::Religious),
    ("ресторан", Category::Restaurant),
    ("кафе", Category::Restaurant),
    ("кофейня", Category::Restaurant),
    ("столовая", Category::Restaurant),
    ("пиццерия", Category::Restaurant),
    ("гостиница", Category::Hotel),
    ("отель", Category::Hotel),
    ("хостел", Category::Hotel),
    ("кинотеатр", Category::Entertainment),
    ("музей", Category::Culture),
    ("театр", Category::Culture),
    ("галерея", Category::Culture),
    ("выставк", Category::Culture),
    ("библиотек", Category::Culture),
    ("парковка", Category::Transport),
    ("аквапарк", Category::Entertainment),
    ("парк", Category::Nature),
    ("сквер", Category::Nature),
    ("заповедник", Category::Nature),
    ("набережная", Category::Nature),
    ("спортзал", Category::Sport),
    ("фитнес", Category::Sport),
    ("стадион", Category::Sport),
    ("бассейн", Category::Sport),
    ("торговый центр", Category::Shopping),
    ("магазин", Category::Shopping),
    ("рынок", Category::Shopping),
    ("развлекател", Category::Entertainment),
    ("ночной клуб", Category::Entertainment),
    ("вокзал", Category::Transport),
    ("аэропорт", Category::Transport),
    ("станция", Category::Transport),
    ("остановка", Category::Transport),
    ("больниц", Category::Health),
    ("поликлиник", Category::Health),
    ("клиника", Category::Health),
    ("аптека", Category::Health),
    ("детский сад", Category::Education),
    ("школа", Category::Education),
    ("университет", Category::Education),
    ("институт", Category::Education),
    ("колледж", Category::Education),
    ("храм", Category::Religious),
    ("церковь", Category::Religious),
    ("собор", Category::Religious),
    ("мечеть", Category::Religious),
    ("синагога", Category::Religious),
    ("достопримечательност", Category::Attraction),
    ("памятник", Category::Attraction),
    // English / Google Places type tokens
    ("tourist_attraction", Category::Attraction),
    ("landmark", Category::Attraction),
    ("monument", Category::Attraction),
    ("restaurant", Category::Restaurant),
    ("cafe", Category::Restaurant),
    ("bakery", Category::Restaurant),
    ("meal_", Category::Restaurant),
    ("food", Category::Restaurant),
    ("lodging", Category::Hotel),
    ("hotel", Category::Hotel),
    ("hostel", Category::Hotel),
    ("shopping_mall", Category::Shopping),
    ("store", Category::Shopping),
    ("market", Category::Shopping),
    ("movie_theater", Category::Entertainment),
    ("amusement_park", Category::Entertainment),
    ("night_club", Category::Entertainment),
    ("casino", Category::Entertainment),
    ("bowling_alley", Category::Entertainment),
    ("aquarium", Category::Entertainment),
    ("zoo", Category::Entertainment),
    ("parking", Category::Transport),
    ("station", Category::Transport),
    ("airport", Category::Transport),
    ("taxi_stand", Category::Transport),
    ("hospital", Category::Health),
    ("pharmacy", Category::Health),
    ("doctor", Category::Health),
    ("dentist", Category::Health),
    ("health", Category::Health),
    ("school", Category::Education),
    ("university", Category::Education),
    ("church", Category::Religious),
    ("mosque", Category::Religious),
    ("synagogue", Category::Religious),
    ("temple", Category::Religious),
    ("place_of_worship", Category::Religious),
    ("park", Category::Nature),
    ("natural_feature", Category::Nature),
    ("campground", Category::Nature),
    ("museum", Category::Culture),
    ("art_gallery", Category::Culture),
    ("library", Category::Culture),
    ("theater", Category::Culture),
    ("theatre", Category::Culture),
    ("gym", Category::Sport),
    ("stadium", Category::Sport),
    ("sports", Category::Sport),
];

/// Category of the first token that matches any rule.
pub fn classify<S: AsRef<str>>(native_types: &[S]) -> Category {
    native_types
        .iter()
        .find_map(|token| classify_token(token.as_ref()))
        .unwrap_or(Category::Other)
}

/// First rule, in declaration order, whose key occurs in the lowercased token.
pub fn classify_token(token: &str) -> Option<Category> {
    let lowered = token.to_lowercase();
    CATEGORY_RULES
        .iter()
        .find(|(key, _)| lowered.contains(*key))
        .map(|(_, category)| *category)
}
