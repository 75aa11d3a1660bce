//! Bootstrap colour palette usable as `$name` or `$name-<shade>` in label colours.

/// Shades 100 to 900 of every colour family; shade 500 doubles as the bare family name.
const FAMILIES: &[(&str, [&str; 9])] = &[
    ("blue", ["#CFE2FF", "#9EC5FE", "#6EA8FE", "#3D8BFD", "#0D6EFD", "#0A58CA", "#084298", "#052C65", "#031633"]),
    ("indigo", ["#E0CFFC", "#C29FFA", "#A370F7", "#8540F5", "#6610F2", "#520DC2", "#3D0A91", "#290661", "#140330"]),
    ("purple", ["#E2D9F3", "#C5B3E6", "#A98EDA", "#8C68CD", "#6F42C1", "#59359A", "#432874", "#2C1A4D", "#160D27"]),
    ("pink", ["#F7D6E6", "#EFADCE", "#E685B5", "#DE5C9D", "#D63384", "#AB296A", "#801F4F", "#561435", "#2B0A1A"]),
    ("red", ["#F8D7DA", "#F1AEB5", "#EA868F", "#E35D6A", "#DC3545", "#B02A37", "#842029", "#58151C", "#2C0B0E"]),
    ("orange", ["#FFE5D0", "#FECBA1", "#FEB272", "#FD9843", "#FD7E14", "#CA6510", "#984C0C", "#653208", "#331904"]),
    ("yellow", ["#FFF3CD", "#FFE69C", "#FFDA6A", "#FFCD39", "#FFC107", "#CC9A06", "#997404", "#664D03", "#332701"]),
    ("green", ["#D1E7DD", "#A3CFBB", "#75B798", "#479F76", "#198754", "#146C43", "#0F5132", "#0A3622", "#051B11"]),
    ("teal", ["#D2F4EA", "#A6E9D5", "#79DFC1", "#4DD4AC", "#20C997", "#1AA179", "#13795B", "#0D503C", "#06281E"]),
    ("cyan", ["#CFF4FC", "#9EEAF9", "#6EDFF6", "#3DD5F3", "#0DCAF0", "#0AA2C0", "#087990", "#055160", "#032830"]),
    ("gray", ["#EFF0F2", "#DEE1E5", "#CED3D7", "#BDC4CA", "#ADB5BD", "#8A9197", "#686D71", "#45484C", "#232426"]),
];

/// Resolves a `$token` to its hex value. Colours without a leading `$` are returned unchanged;
/// unknown tokens resolve to `None`.
pub fn resolve(color: &str) -> Option<String> {
    let Some(token) = color.strip_prefix('$') else {
        return Some(color.to_string());
    };

    match token {
        "white" => return Some("#fff".to_string()),
        "black" => return Some("#000".to_string()),
        _ => {}
    }

    let (family, shade) = match token.split_once('-') {
        Some((family, shade)) => (family, shade.parse::<usize>().ok()?),
        None => (token, 500),
    };
    if shade % 100 != 0 || !(100..=900).contains(&shade) {
        return None;
    }

    FAMILIES
        .iter()
        .find(|(name, _)| *name == family)
        .map(|(_, shades)| shades[shade / 100 - 1].to_string())
}
