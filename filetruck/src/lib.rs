//! Project descriptor tooling: recover the group tree from a `project.pbxproj`-style
//! descriptor, move source files so the disk layout mirrors the groups, and patch the
//! descriptor in place so it points at the new locations.
//!
//! The pipeline is strictly sequential: parse -> link -> plan -> move -> rewrite.

pub mod core {
    use indexmap::IndexMap;
    use serde::Serialize;
    use std::fmt;

    /* ------------------------------- IDs ------------------------------- */

    /// Opaque hex identifier assigned by the IDE.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
    #[serde(transparent)]
    pub struct EntityId(pub String);

    impl EntityId {
        pub fn new(id: impl Into<String>) -> Self {
            Self(id.into())
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl fmt::Display for EntityId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /* ---------------------------- Source trees ---------------------------- */

    /// How a path in the descriptor is anchored.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Scheme {
        /// `<group>`: relative to the enclosing group.
        Group,
        /// `<absolute>`
        Absolute,
        /// `SOURCE_ROOT`
        SourceRoot,
        /// `DEVELOPER_DIR`
        DeveloperDir,
        /// `BUILT_PRODUCTS_DIR`
        BuiltProductsDir,
        /// `SDKROOT`
        SdkRoot,
        Unknown(String),
    }

    impl Scheme {
        pub fn from_token(token: &str) -> Self {
            match unquote(token.trim()) {
                "<group>" => Scheme::Group,
                "<absolute>" => Scheme::Absolute,
                "SOURCE_ROOT" => Scheme::SourceRoot,
                "DEVELOPER_DIR" => Scheme::DeveloperDir,
                "BUILT_PRODUCTS_DIR" => Scheme::BuiltProductsDir,
                "SDKROOT" => Scheme::SdkRoot,
                other => Scheme::Unknown(other.to_string()),
            }
        }
    }

    /// A `sourceTree = ...;` value exactly as written, plus its interpretation.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct SourceTree {
        pub raw: String,
        pub scheme: Scheme,
    }

    impl SourceTree {
        pub fn parse(raw: &str) -> Self {
            Self {
                raw: raw.to_string(),
                scheme: Scheme::from_token(raw),
            }
        }
    }

    impl fmt::Display for SourceTree {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.raw)
        }
    }

    /// Strip one pair of surrounding double quotes, if present.
    pub fn unquote(value: &str) -> &str {
        value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value)
    }

    /* ------------------------------ Entities ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Entity {
        pub id: EntityId,
        /// Display label taken from the `/* ... */` comment.
        pub name: String,
        /// Non-owning back-reference to the enclosing section, set by linking.
        pub parent: Option<EntityId>,
        pub kind: EntityKind,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum EntityKind {
        Section(Section),
        File(FileReference),
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct Section {
        /// Children in descriptor order.
        pub children: IndexMap<EntityId, Child>,
        pub location: Option<SourceTree>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct FileReference {
        /// The `path = ...;` value as written (may be quoted).
        pub path: String,
        pub location: SourceTree,
    }

    /// A child slot: a forward reference until the linker resolves it.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Child {
        Link(Link),
        Resolved(EntityId),
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Link {
        pub id: EntityId,
        pub name: String,
    }

    impl Entity {
        pub fn section(id: impl Into<String>, name: impl Into<String>) -> Self {
            Self {
                id: EntityId::new(id),
                name: name.into(),
                parent: None,
                kind: EntityKind::Section(Section::default()),
            }
        }

        pub fn file(
            id: impl Into<String>,
            name: impl Into<String>,
            path: impl Into<String>,
            location: SourceTree,
        ) -> Self {
            Self {
                id: EntityId::new(id),
                name: name.into(),
                parent: None,
                kind: EntityKind::File(FileReference {
                    path: path.into(),
                    location,
                }),
            }
        }

        pub fn is_file(&self) -> bool {
            matches!(self.kind, EntityKind::File(_))
        }

        pub fn as_section(&self) -> Option<&Section> {
            match &self.kind {
                EntityKind::Section(section) => Some(section),
                EntityKind::File(_) => None,
            }
        }

        pub fn as_section_mut(&mut self) -> Option<&mut Section> {
            match &mut self.kind {
                EntityKind::Section(section) => Some(section),
                EntityKind::File(_) => None,
            }
        }

        pub fn as_file(&self) -> Option<&FileReference> {
            match &self.kind {
                EntityKind::File(file) => Some(file),
                EntityKind::Section(_) => None,
            }
        }

        pub fn location(&self) -> Option<&SourceTree> {
            match &self.kind {
                EntityKind::Section(section) => section.location.as_ref(),
                EntityKind::File(file) => Some(&file.location),
            }
        }
    }

    impl Section {
        pub fn add_link(&mut self, link: Link) {
            self.children.insert(link.id.clone(), Child::Link(link));
        }
    }

    /* -------------------------------- Store -------------------------------- */

    /// Owns every entity of one descriptor, keyed by ID in parse order.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct EntityStore {
        entities: IndexMap<EntityId, Entity>,
        duplicates: Vec<EntityId>,
    }

    impl EntityStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Insert an entity; a later definition of the same ID replaces the earlier one
        /// in place and is recorded in [`EntityStore::duplicates`].
        pub fn insert(&mut self, entity: Entity) -> Option<Entity> {
            let id = entity.id.clone();
            let previous = self.entities.insert(id.clone(), entity);
            if previous.is_some() {
                self.duplicates.push(id);
            }
            previous
        }

        pub fn get(&self, id: &EntityId) -> Option<&Entity> {
            self.entities.get(id)
        }

        pub fn get_mut(&mut self, id: &EntityId) -> Option<&mut Entity> {
            self.entities.get_mut(id)
        }

        pub fn contains(&self, id: &EntityId) -> bool {
            self.entities.contains_key(id)
        }

        pub fn iter(&self) -> impl Iterator<Item = &Entity> {
            self.entities.values()
        }

        pub fn len(&self) -> usize {
            self.entities.len()
        }

        pub fn is_empty(&self) -> bool {
            self.entities.is_empty()
        }

        /// IDs that were defined more than once while parsing.
        pub fn duplicates(&self) -> &[EntityId] {
            &self.duplicates
        }
    }
}

pub mod descriptor {
    //! Line-preserving descriptor text. Every line keeps its own terminator so that
    //! writing the text back is byte-identical for lines nobody touched.

    use anyhow::{Context, Result};
    use std::{fmt, fs, path::Path};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum LineEnding {
        Lf,
        CrLf,
        None,
    }

    impl LineEnding {
        fn as_str(self) -> &'static str {
            match self {
                LineEnding::Lf => "\n",
                LineEnding::CrLf => "\r\n",
                LineEnding::None => "",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Line {
        content: String,
        ending: LineEnding,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct DescriptorText {
        lines: Vec<Line>,
    }

    impl DescriptorText {
        pub fn from_text(text: &str) -> Self {
            let lines = text
                .split_inclusive('\n')
                .map(|raw| {
                    if let Some(content) = raw.strip_suffix("\r\n") {
                        Line {
                            content: content.to_string(),
                            ending: LineEnding::CrLf,
                        }
                    } else if let Some(content) = raw.strip_suffix('\n') {
                        Line {
                            content: content.to_string(),
                            ending: LineEnding::Lf,
                        }
                    } else {
                        Line {
                            content: raw.to_string(),
                            ending: LineEnding::None,
                        }
                    }
                })
                .collect();
            Self { lines }
        }

        pub fn read(path: &Path) -> Result<Self> {
            let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            Ok(Self::from_text(&text))
        }

        pub fn write(&self, path: &Path) -> Result<()> {
            fs::write(path, self.to_string().as_bytes())
                .with_context(|| format!("writing {:?}", path))
        }

        /// Line contents without terminators.
        pub fn lines(&self) -> impl Iterator<Item = &str> {
            self.lines.iter().map(|line| line.content.as_str())
        }

        pub fn line(&self, index: usize) -> Option<&str> {
            self.lines.get(index).map(|line| line.content.as_str())
        }

        /// Replace the content of one line, keeping its terminator.
        pub fn set_line(&mut self, index: usize, content: String) {
            if let Some(line) = self.lines.get_mut(index) {
                line.content = content;
            }
        }

        pub fn len(&self) -> usize {
            self.lines.len()
        }

        pub fn is_empty(&self) -> bool {
            self.lines.is_empty()
        }
    }

    impl fmt::Display for DescriptorText {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            for line in &self.lines {
                f.write_str(&line.content)?;
                f.write_str(line.ending.as_str())?;
            }
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn mixed_line_endings_round_trip() {
            let input = "a\r\nb\nc";
            let text = DescriptorText::from_text(input);
            assert_eq!(text.len(), 3);
            assert_eq!(text.lines().collect::<Vec<_>>(), vec!["a", "b", "c"]);
            assert_eq!(text.to_string(), input);
        }

        #[test]
        fn set_line_keeps_terminator() {
            let mut text = DescriptorText::from_text("one\r\ntwo\n");
            text.set_line(0, "uno".into());
            assert_eq!(text.to_string(), "uno\r\ntwo\n");
        }

        #[test]
        fn read_and_write_through_disk() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("project.pbxproj");
            std::fs::write(&path, "x\ny\n").expect("seed");

            let mut text = DescriptorText::read(&path).expect("read");
            text.set_line(1, "z".into());
            text.write(&path).expect("write");

            assert_eq!(std::fs::read_to_string(&path).expect("reread"), "x\nz\n");
        }

        #[test]
        fn missing_file_is_an_error() {
            let tmp = tempfile::tempdir().expect("tempdir");
            assert!(DescriptorText::read(&tmp.path().join("nope.pbxproj")).is_err());
        }
    }
}

pub mod parser {
    //! Line-oriented descriptor parser built on `nom`.
    //!
    //! Strategy: a single forward pass over lines with three states (top level, section
    //! body, children list). Each line is tried against a small set of `nom` patterns;
    //! the first pattern that fits decides the transition. No backtracking across lines.
    //!
    //! A file reference is only recognised when its ID, name comment, `path` and
    //! `sourceTree` fields share one physical line.

    use crate::core::*;
    use nom::{
        IResult,
        bytes::complete::{is_not, tag, take_while1},
        character::complete::{char, multispace0},
        combinator::{eof, verify},
        sequence::{delimited, preceded, terminated, tuple},
    };
    use tracing::{debug, warn};

    type PResult<'a, T> = IResult<&'a str, T>;

    enum State {
        TopLevel,
        SectionBody(EntityId),
        Children(EntityId),
    }

    /// Parse descriptor lines (without terminators) into an unlinked entity store.
    pub fn parse_descriptor<'a, I>(lines: I) -> EntityStore
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut store = EntityStore::new();
        let mut state = State::TopLevel;

        for line in lines {
            state = match state {
                State::TopLevel => {
                    if let Ok((_, (id, name))) = section_open(line) {
                        let entity = Entity::section(id, name);
                        let id = entity.id.clone();
                        insert(&mut store, entity);
                        State::SectionBody(id)
                    } else {
                        if let Some(entity) = file_reference(line) {
                            insert(&mut store, entity);
                        }
                        State::TopLevel
                    }
                }
                State::SectionBody(current) => {
                    if section_end(line).is_ok() {
                        State::TopLevel
                    } else if children_start(line).is_ok() {
                        State::Children(current)
                    } else {
                        if let Ok((_, raw)) = source_tree_line(line) {
                            if let Some(section) = section_mut(&mut store, &current) {
                                section.location = Some(SourceTree::parse(raw));
                            }
                        }
                        State::SectionBody(current)
                    }
                }
                State::Children(current) => {
                    if section_end(line).is_ok() {
                        State::TopLevel
                    } else if children_end(line).is_ok() {
                        State::SectionBody(current)
                    } else {
                        if let Ok((_, (id, name))) = child_link(line) {
                            if let Some(section) = section_mut(&mut store, &current) {
                                section.add_link(Link {
                                    id: EntityId::new(id),
                                    name: name.to_string(),
                                });
                            }
                        }
                        State::Children(current)
                    }
                }
            };
        }

        debug!(entities = store.len(), "parsed descriptor");
        store
    }

    fn insert(store: &mut EntityStore, entity: Entity) {
        let id = entity.id.clone();
        if store.insert(entity).is_some() {
            warn!(%id, "duplicate entity id, later definition wins");
        }
    }

    fn section_mut<'s>(store: &'s mut EntityStore, id: &EntityId) -> Option<&'s mut Section> {
        store.get_mut(id).and_then(Entity::as_section_mut)
    }

    /* ------------------------------ Patterns ------------------------------ */

    fn hex_id(i: &str) -> PResult<'_, &str> {
        take_while1(|c: char| c.is_ascii_hexdigit())(i)
    }

    /// `/* name */`; the name is everything up to the space before `*/`.
    fn name_comment(i: &str) -> PResult<'_, &str> {
        let (rest, raw) = verify(
            delimited(tag("/* "), is_not("*"), tag("*/")),
            |raw: &str| raw.len() >= 2 && raw.ends_with(' '),
        )(i)?;
        Ok((rest, &raw[..raw.len() - 1]))
    }

    fn id_and_name(i: &str) -> PResult<'_, (&str, &str)> {
        preceded(
            multispace0,
            tuple((terminated(hex_id, char(' ')), name_comment)),
        )(i)
    }

    fn section_open(i: &str) -> PResult<'_, (&str, &str)> {
        terminated(id_and_name, tuple((tag(" = {"), eof)))(i)
    }

    fn section_end(i: &str) -> PResult<'_, &str> {
        delimited(multispace0, tag("};"), eof)(i)
    }

    fn children_start(i: &str) -> PResult<'_, &str> {
        preceded(multispace0, tag("children = ("))(i)
    }

    fn children_end(i: &str) -> PResult<'_, &str> {
        preceded(multispace0, tag(");"))(i)
    }

    fn child_link(i: &str) -> PResult<'_, (&str, &str)> {
        terminated(id_and_name, char(','))(i)
    }

    fn source_tree_line(i: &str) -> PResult<'_, &str> {
        delimited(
            preceded(multispace0, tag("sourceTree = ")),
            is_not(";"),
            char(';'),
        )(i)
    }

    fn path_and_source_tree(i: &str) -> PResult<'_, (&str, &str)> {
        let (rest, (_, path, _, tree, _)) = tuple((
            tag(" path = "),
            is_not(";"),
            tag("; sourceTree = "),
            is_not(";"),
            char(';'),
        ))(i)?;
        Ok((rest, (path, tree)))
    }

    /// `<ID> /* name */ = ... path = X; sourceTree = Y; ...` on one line. When the
    /// fields occur more than once the last complete occurrence wins.
    fn file_reference(line: &str) -> Option<Entity> {
        let (rest, (id, name)) = terminated(id_and_name, tag(" = "))(line).ok()?;
        let starts: Vec<usize> = rest.match_indices(" path = ").map(|(at, _)| at).collect();
        let (path, tree) = starts
            .into_iter()
            .rev()
            .find_map(|at| path_and_source_tree(&rest[at..]).ok().map(|(_, v)| v))?;
        Some(Entity::file(id, name, path, SourceTree::parse(tree)))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::fixtures::SCENARIO;

        fn parse(text: &str) -> EntityStore {
            parse_descriptor(text.lines())
        }

        fn section<'a>(store: &'a EntityStore, id: &str) -> &'a Section {
            store
                .get(&EntityId::new(id))
                .and_then(Entity::as_section)
                .expect("section")
        }

        #[test]
        fn name_comment_keeps_inner_spaces() {
            let (_, name) = name_comment("/* Supporting Files */,").expect("comment");
            assert_eq!(name, "Supporting Files");
            assert!(name_comment("/**/").is_err());
        }

        #[test]
        fn scenario_descriptor_parses_sections_and_file() {
            let store = parse(SCENARIO);
            assert_eq!(store.len(), 3);

            let a = section(&store, "AAAA");
            assert_eq!(a.children.len(), 1);
            assert!(matches!(
                a.children.get(&EntityId::new("BBBB")),
                Some(Child::Link(Link { name, .. })) if name == "B"
            ));

            let file = store
                .get(&EntityId::new("CCCC"))
                .and_then(Entity::as_file)
                .expect("file");
            assert_eq!(file.path, "foo.m");
            assert_eq!(file.location.scheme, Scheme::Group);
            assert_eq!(file.location.raw, "\"<group>\"");
        }

        #[test]
        fn section_without_children_has_empty_children() {
            let store = parse(
                "\t\tEEEE /* Empty */ = {\n\t\t\tisa = PBXGroup;\n\t\t\tsourceTree = SOURCE_ROOT;\n\t\t};\n",
            );
            let empty = section(&store, "EEEE");
            assert!(empty.children.is_empty());
            assert_eq!(
                empty.location.as_ref().map(|l| l.scheme.clone()),
                Some(Scheme::SourceRoot)
            );
        }

        #[test]
        fn empty_children_list_stays_empty() {
            let store = parse("EEEE /* Empty */ = {\nchildren = (\n);\n};\n");
            assert!(section(&store, "EEEE").children.is_empty());
        }

        #[test]
        fn children_keep_descriptor_order() {
            let store = parse(
                "AAAA /* A */ = {\n children = (\n  3333 /* c */,\n  1111 /* a */,\n  2222 /* b */,\n );\n};\n",
            );
            let order: Vec<&str> = section(&store, "AAAA")
                .children
                .keys()
                .map(EntityId::as_str)
                .collect();
            assert_eq!(order, vec!["3333", "1111", "2222"]);
        }

        #[test]
        fn file_reference_split_across_lines_is_not_recognised() {
            let store = parse(
                "CCCC /* foo.m */ = {isa = PBXFileReference; path = foo.m;\n sourceTree = \"<group>\"; };\n",
            );
            assert!(store.is_empty());
        }

        #[test]
        fn file_reference_inside_section_body_is_ignored() {
            let store = parse(
                "AAAA /* A */ = {\nCCCC /* foo.m */ = {isa = PBXFileReference; path = foo.m; sourceTree = \"<group>\"; };\n};\n",
            );
            assert_eq!(store.len(), 1);
        }

        #[test]
        fn quoted_path_and_named_file_reference() {
            let store = parse(
                "DDDD /* My View.m */ = {isa = PBXFileReference; name = \"My View.m\"; path = \"Sources/My View.m\"; sourceTree = SDKROOT; };",
            );
            let file = store
                .get(&EntityId::new("DDDD"))
                .and_then(Entity::as_file)
                .expect("file");
            assert_eq!(file.path, "\"Sources/My View.m\"");
            assert_eq!(unquote(&file.path), "Sources/My View.m");
            assert_eq!(file.location.scheme, Scheme::SdkRoot);
        }

        #[test]
        fn duplicate_id_overwrites_and_is_recorded() {
            let store = parse("AAAA /* First */ = {\n};\nAAAA /* Second */ = {\n};\n");
            assert_eq!(store.len(), 1);
            assert_eq!(store.get(&EntityId::new("AAAA")).map(|e| e.name.as_str()), Some("Second"));
            assert_eq!(store.duplicates(), &[EntityId::new("AAAA")]);
        }

        #[test]
        fn section_closing_inside_children_returns_to_top_level() {
            let store = parse(
                "AAAA /* A */ = {\nchildren = (\n1111 /* x */,\n};\nBBBB /* B */ = {\n};\n",
            );
            assert_eq!(store.len(), 2);
            assert_eq!(section(&store, "AAAA").children.len(), 1);
        }

        #[test]
        fn non_hex_ids_are_not_sections() {
            let store = parse("objects = {\nXYZ /* nope */ = {\n};\n");
            assert!(store.is_empty());
        }
    }
}

pub mod linker {
    //! Turns child placeholders into real references and answers tree queries.

    use crate::core::*;
    use std::collections::HashSet;
    use tracing::debug;

    /// Resolve every placeholder whose ID exists in the store and set back-links.
    /// Dangling placeholders stay where they are. Running this twice is a no-op.
    pub fn link_entities(store: &mut EntityStore) {
        let mut resolved = Vec::new();
        for entity in store.iter() {
            let Some(section) = entity.as_section() else {
                continue;
            };
            for child in section.children.values() {
                if let Child::Link(link) = child {
                    if store.contains(&link.id) {
                        resolved.push((entity.id.clone(), link.id.clone()));
                    } else {
                        debug!(parent = %entity.id, child = %link.id, "dangling child reference");
                    }
                }
            }
        }

        for (parent_id, child_id) in resolved {
            if let Some(section) = store.get_mut(&parent_id).and_then(Entity::as_section_mut) {
                section
                    .children
                    .insert(child_id.clone(), Child::Resolved(child_id.clone()));
            }
            if let Some(child) = store.get_mut(&child_id) {
                child.parent = Some(parent_id);
            }
        }
    }

    /// Entities with no parent that are not files, in store order.
    pub fn top_level(store: &EntityStore) -> Vec<&Entity> {
        store
            .iter()
            .filter(|entity| entity.parent.is_none() && !entity.is_file())
            .collect()
    }

    /// One stop of a depth-first walk.
    #[derive(Debug, Clone, Copy)]
    pub enum Node<'a> {
        Entity(&'a Entity),
        /// A placeholder the linker could not resolve.
        Dangling(&'a Link),
    }

    impl<'a> Node<'a> {
        pub fn id(&self) -> &'a EntityId {
            match self {
                Node::Entity(entity) => &entity.id,
                Node::Dangling(link) => &link.id,
            }
        }

        pub fn name(&self) -> &'a str {
            match self {
                Node::Entity(entity) => &entity.name,
                Node::Dangling(link) => &link.name,
            }
        }

        pub fn location(&self) -> Option<&'a SourceTree> {
            match self {
                Node::Entity(entity) => entity.location(),
                Node::Dangling(_) => None,
            }
        }
    }

    /// Pre-order walk over `roots` in order, calling `visit(node, depth)`. Each entity is
    /// entered at most once for the whole walk, so shared children and cycles cost
    /// nothing extra.
    pub fn visit_depth_first<'a, F>(store: &'a EntityStore, roots: &[&'a Entity], mut visit: F)
    where
        F: FnMut(Node<'a>, usize),
    {
        let mut visited = HashSet::new();
        for root in roots {
            walk(store, root, 0, &mut visited, &mut visit);
        }
    }

    fn walk<'a, F>(
        store: &'a EntityStore,
        entity: &'a Entity,
        depth: usize,
        visited: &mut HashSet<&'a EntityId>,
        visit: &mut F,
    ) where
        F: FnMut(Node<'a>, usize),
    {
        if !visited.insert(&entity.id) {
            debug!(id = %entity.id, "already visited, not descending");
            return;
        }
        visit(Node::Entity(entity), depth);
        if let Some(section) = entity.as_section() {
            for child in section.children.values() {
                match child {
                    Child::Resolved(id) => {
                        if let Some(next) = store.get(id) {
                            walk(store, next, depth + 1, visited, visit);
                        }
                    }
                    Child::Link(link) => visit(Node::Dangling(link), depth + 1),
                }
            }
        }
    }

}

pub mod location {
    //! Target directory computation per source-tree scheme.

    use crate::core::*;
    use serde::Serialize;
    use std::{
        collections::HashSet,
        path::{Path, PathBuf},
    };

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum LocationError {
        #[error("entity {0} is not attached to any group")]
        Detached(EntityId),
        #[error("ancestor {0} is missing from the descriptor")]
        MissingAncestor(EntityId),
        #[error("group chain above {0} loops back on itself")]
        Cycle(EntityId),
    }

    /// Directory a file belongs in: the project root followed by its group names.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct TargetDir {
        pub project_root: PathBuf,
        /// Ancestor group names, root first.
        pub groups: Vec<String>,
    }

    impl TargetDir {
        pub fn path(&self) -> PathBuf {
            self.groups
                .iter()
                .fold(self.project_root.clone(), |dir, group| dir.join(group))
        }

        /// Descriptor-relative path for `file_name` inside this directory, with the
        /// top-level group segment dropped.
        pub fn descriptor_path(&self, file_name: &str) -> String {
            let mut joined = self.groups.join("/");
            joined.push('/');
            joined.push_str(file_name);
            let normalized = normalize(&joined);
            match normalized.split_once('/') {
                Some((_, rest)) => rest.to_string(),
                None => normalized,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Resolution {
        Target(TargetDir),
        /// The scheme has no resolution strategy; skip the entity.
        Unsupported(Scheme),
    }

    /// The descriptor sits inside a bundle directory (`App.xcodeproj/project.pbxproj`),
    /// so the project root is one level above the descriptor's directory.
    pub fn project_root(descriptor: &Path) -> PathBuf {
        let containing = descriptor.parent().unwrap_or_else(|| Path::new(""));
        match containing.parent() {
            Some(root) => root.to_path_buf(),
            None => containing.join(".."),
        }
    }

    pub struct LocationResolver<'a> {
        store: &'a EntityStore,
        project_root: PathBuf,
    }

    impl<'a> LocationResolver<'a> {
        pub fn new(store: &'a EntityStore, descriptor: &Path) -> Self {
            Self {
                store,
                project_root: project_root(descriptor),
            }
        }

        pub fn project_root(&self) -> &Path {
            &self.project_root
        }

        pub fn resolve(
            &self,
            entity: &Entity,
            file: &FileReference,
        ) -> Result<Resolution, LocationError> {
            debug_assert!(!file.location.raw.is_empty(), "file without source tree");
            match &file.location.scheme {
                Scheme::Group => Ok(Resolution::Target(TargetDir {
                    project_root: self.project_root.clone(),
                    groups: self.group_chain(entity)?,
                })),
                scheme @ (Scheme::Absolute
                | Scheme::SourceRoot
                | Scheme::DeveloperDir
                | Scheme::BuiltProductsDir
                | Scheme::SdkRoot
                | Scheme::Unknown(_)) => Ok(Resolution::Unsupported(scheme.clone())),
            }
        }

        fn group_chain(&self, entity: &Entity) -> Result<Vec<String>, LocationError> {
            let mut cursor = entity
                .parent
                .as_ref()
                .ok_or_else(|| LocationError::Detached(entity.id.clone()))?;
            let mut seen = HashSet::new();
            let mut names = Vec::new();
            loop {
                if !seen.insert(cursor) {
                    return Err(LocationError::Cycle(entity.id.clone()));
                }
                let ancestor = self
                    .store
                    .get(cursor)
                    .ok_or_else(|| LocationError::MissingAncestor(cursor.clone()))?;
                names.push(ancestor.name.clone());
                match &ancestor.parent {
                    Some(next) => cursor = next,
                    None => break,
                }
            }
            names.reverse();
            Ok(names)
        }
    }

    /// Resolve `.` and `..` segments of a `/`-separated relative path.
    pub fn normalize(path: &str) -> String {
        let mut segments: Vec<&str> = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                other => segments.push(other),
            }
        }
        segments.join("/")
    }

}

pub mod planner {
    //! Walks the linked tree and decides, per file, whether to move and rewrite it.

    use crate::core::*;
    use crate::linker::{Node, top_level, visit_depth_first};
    use crate::location::{LocationResolver, Resolution};
    use serde::Serialize;
    use std::path::{Path, PathBuf};
    use tracing::warn;

    /// Which mechanism physically moves files.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum MoveMechanism {
        #[default]
        Plain,
        /// `git mv`, falling back to a plain rename.
        Git,
    }

    /// Run configuration, built once and passed down by reference.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Settings {
        pub move_files: bool,
        pub rewrite_descriptor: bool,
        pub mover: MoveMechanism,
        /// Files whose name ends with any of these (case-sensitive) are left alone.
        pub ignore_suffixes: Vec<String>,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                move_files: true,
                rewrite_descriptor: true,
                mover: MoveMechanism::Plain,
                ignore_suffixes: vec!["framework".to_string()],
            }
        }
    }

    impl Settings {
        pub fn ignored_suffix(&self, name: &str) -> Option<&str> {
            self.ignore_suffixes
                .iter()
                .map(String::as_str)
                .find(|suffix| name.ends_with(suffix))
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct MoveInstruction {
        pub id: EntityId,
        pub name: String,
        pub source: PathBuf,
        pub target_dir: PathBuf,
    }

    impl MoveInstruction {
        pub fn destination(&self) -> PathBuf {
            self.target_dir.join(&self.name)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct RewriteRecord {
        pub id: EntityId,
        pub new_path: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum SkipReason {
        Ignored { suffix: String },
        Unsupported { scheme: Scheme },
        Unresolvable { message: String },
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Skipped {
        pub id: EntityId,
        pub name: String,
        pub reason: SkipReason,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct Plan {
        pub moves: Vec<MoveInstruction>,
        pub rewrites: Vec<RewriteRecord>,
        pub skipped: Vec<Skipped>,
    }

    impl Plan {
        /// Drop rewrite records for entities whose move did not happen.
        pub fn suppress_rewrites(&mut self, failed: &[EntityId]) {
            self.rewrites.retain(|record| !failed.contains(&record.id));
        }
    }

    pub fn plan_reorganize(store: &EntityStore, descriptor: &Path, settings: &Settings) -> Plan {
        let resolver = LocationResolver::new(store, descriptor);
        let mut plan = Plan::default();
        visit_depth_first(store, &top_level(store), |node, _| {
            let Node::Entity(entity) = node else {
                return;
            };
            if let Some(file) = entity.as_file() {
                plan_file(&resolver, entity, file, settings, &mut plan);
            }
        });
        plan
    }

    fn plan_file(
        resolver: &LocationResolver<'_>,
        entity: &Entity,
        file: &FileReference,
        settings: &Settings,
        plan: &mut Plan,
    ) {
        let skip = |reason: SkipReason| Skipped {
            id: entity.id.clone(),
            name: entity.name.clone(),
            reason,
        };

        if let Some(suffix) = settings.ignored_suffix(&entity.name) {
            warn!(id = %entity.id, name = %entity.name, "ignoring {suffix} reference");
            plan.skipped.push(skip(SkipReason::Ignored {
                suffix: suffix.to_string(),
            }));
            return;
        }

        let target = match resolver.resolve(entity, file) {
            Ok(Resolution::Target(target)) => target,
            Ok(Resolution::Unsupported(scheme)) => {
                warn!(
                    id = %entity.id,
                    name = %entity.name,
                    "skipping: source tree {} is not supported",
                    file.location
                );
                plan.skipped.push(skip(SkipReason::Unsupported { scheme }));
                return;
            }
            Err(err) => {
                warn!(id = %entity.id, name = %entity.name, "skipping: {err}");
                plan.skipped.push(skip(SkipReason::Unresolvable {
                    message: err.to_string(),
                }));
                return;
            }
        };

        if settings.move_files {
            plan.moves.push(MoveInstruction {
                id: entity.id.clone(),
                name: entity.name.clone(),
                source: resolver.project_root().join(unquote(&file.path)),
                target_dir: target.path(),
            });
        }
        if settings.rewrite_descriptor {
            plan.rewrites.push(RewriteRecord {
                id: entity.id.clone(),
                new_path: target.descriptor_path(&entity.name),
            });
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::fixtures::{SCENARIO, linked};

        const DESCRIPTOR: &str = "/work/App/App.xcodeproj/project.pbxproj";

        fn rewrite_only() -> Settings {
            Settings {
                move_files: false,
                ..Settings::default()
            }
        }

        #[test]
        fn scenario_produces_one_rewrite_under_b() {
            let store = linked(SCENARIO);
            let plan = plan_reorganize(&store, Path::new(DESCRIPTOR), &rewrite_only());
            assert!(plan.moves.is_empty());
            assert_eq!(
                plan.rewrites,
                vec![RewriteRecord {
                    id: EntityId::new("CCCC"),
                    new_path: "B/foo.m".into(),
                }]
            );
        }

        #[test]
        fn move_instruction_targets_group_directory() {
            let store = linked(SCENARIO);
            let plan = plan_reorganize(&store, Path::new(DESCRIPTOR), &Settings::default());
            assert_eq!(plan.moves.len(), 1);
            let mv = &plan.moves[0];
            assert_eq!(mv.source, PathBuf::from("/work/App/foo.m"));
            assert_eq!(mv.destination(), PathBuf::from("/work/App/A/B/foo.m"));
        }

        #[test]
        fn frameworks_are_neither_moved_nor_rewritten() {
            let store = linked(
                "AAAA /* A */ = {\nchildren = (\n1111 /* UIKit.framework */,\n2222 /* main.m */,\n);\n};\n\
                 1111 /* UIKit.framework */ = {isa = PBXFileReference; path = UIKit.framework; sourceTree = \"<group>\"; };\n\
                 2222 /* main.m */ = {isa = PBXFileReference; path = main.m; sourceTree = \"<group>\"; };\n",
            );
            let plan = plan_reorganize(&store, Path::new(DESCRIPTOR), &Settings::default());
            assert!(plan.moves.iter().all(|m| m.id.as_str() != "1111"));
            assert!(plan.rewrites.iter().all(|r| r.id.as_str() != "1111"));
            assert_eq!(plan.rewrites.len(), 1);
            assert!(matches!(
                plan.skipped.as_slice(),
                [Skipped { reason: SkipReason::Ignored { .. }, .. }]
            ));
        }

        #[test]
        fn ignore_suffix_is_case_sensitive() {
            let settings = Settings::default();
            assert!(settings.ignored_suffix("Foo.framework").is_some());
            assert!(settings.ignored_suffix("Foo.FRAMEWORK").is_none());
            assert!(settings.ignored_suffix("work").is_none());
        }

        #[test]
        fn unsupported_scheme_is_skipped_and_siblings_continue() {
            let store = linked(
                "AAAA /* A */ = {\nchildren = (\n1111 /* libz.dylib */,\n2222 /* main.m */,\n);\n};\n\
                 1111 /* libz.dylib */ = {isa = PBXFileReference; path = usr/lib/libz.dylib; sourceTree = SDKROOT; };\n\
                 2222 /* main.m */ = {isa = PBXFileReference; path = main.m; sourceTree = \"<group>\"; };\n",
            );
            let plan = plan_reorganize(&store, Path::new(DESCRIPTOR), &Settings::default());
            assert_eq!(plan.moves.len(), 1);
            assert_eq!(plan.moves[0].id, EntityId::new("2222"));
            assert_eq!(plan.rewrites.len(), 1);
            assert_eq!(
                plan.skipped[0].reason,
                SkipReason::Unsupported {
                    scheme: Scheme::SdkRoot
                }
            );
        }

        #[test]
        fn suppress_rewrites_drops_failed_ids() {
            let store = linked(SCENARIO);
            let mut plan = plan_reorganize(&store, Path::new(DESCRIPTOR), &Settings::default());
            plan.suppress_rewrites(&[EntityId::new("CCCC")]);
            assert!(plan.rewrites.is_empty());
        }
    }
}

pub mod mover {
    //! Physical file moves. Failures are reported per file; the batch always continues.

    use crate::core::EntityId;
    use crate::planner::{MoveMechanism, Plan};
    use serde::Serialize;
    use std::{
        collections::HashSet,
        fs, io,
        path::{Path, PathBuf},
        process::{Command, Stdio},
    };
    use tracing::{debug, info, warn};

    #[derive(Debug, thiserror::Error)]
    pub enum MoveError {
        #[error("couldn't create directory {path:?}: {source}")]
        CreateDir {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("couldn't resolve {path:?}: {source}")]
        Resolve {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("couldn't rename {from:?} to {to:?}: {source}")]
        Rename {
            from: PathBuf,
            to: PathBuf,
            #[source]
            source: io::Error,
        },
    }

    pub trait FileMover {
        /// Move `from` to `to`, creating any missing parent directories of `to`.
        fn move_file(&self, from: &Path, to: &Path) -> Result<(), MoveError>;
    }

    pub struct PlainMover;

    impl FileMover for PlainMover {
        fn move_file(&self, from: &Path, to: &Path) -> Result<(), MoveError> {
            ensure_parent(to)?;
            let renamed = match fs::rename(from, to) {
                Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
                    debug!(?from, "rename crosses devices, copying instead");
                    copy_then_remove(from, to)
                }
                other => other,
            };
            renamed.map_err(|source| MoveError::Rename {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
                source,
            })
        }
    }

    fn copy_then_remove(from: &Path, to: &Path) -> io::Result<()> {
        fs::copy(from, to)?;
        fs::remove_file(from)
    }

    /// Tries `git mv` first so history follows the file, then falls back to a rename.
    pub struct GitMover;

    impl FileMover for GitMover {
        fn move_file(&self, from: &Path, to: &Path) -> Result<(), MoveError> {
            ensure_parent(to)?;
            let from_abs = absolute(from)?;
            let to_abs = absolute(to)?;
            let workdir = from_abs
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));

            let status = Command::new("git")
                .arg("mv")
                .arg(&from_abs)
                .arg(&to_abs)
                .current_dir(&workdir)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match status {
                Ok(status) if status.success() => return Ok(()),
                Ok(status) => debug!(?from, "git mv exited with {status}, falling back"),
                Err(err) => debug!(?from, "git mv could not run ({err}), falling back"),
            }
            PlainMover.move_file(&from_abs, &to_abs)
        }
    }

    pub fn mover_for(mechanism: MoveMechanism) -> Box<dyn FileMover> {
        match mechanism {
            MoveMechanism::Plain => Box::new(PlainMover),
            MoveMechanism::Git => Box::new(GitMover),
        }
    }

    fn ensure_parent(to: &Path) -> Result<(), MoveError> {
        match to.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                fs::create_dir_all(dir).map_err(|source| MoveError::CreateDir {
                    path: dir.to_path_buf(),
                    source,
                })
            }
            _ => Ok(()),
        }
    }

    fn absolute(path: &Path) -> Result<PathBuf, MoveError> {
        std::path::absolute(path).map_err(|source| MoveError::Resolve {
            path: path.to_path_buf(),
            source,
        })
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct ExecutionReport {
        pub moved: Vec<EntityId>,
        pub failed: Vec<EntityId>,
    }

    /// Run every planned move in order, one at a time. Only the first instruction for
    /// an ID is attempted.
    pub fn execute_moves(plan: &Plan, mover: &dyn FileMover) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        let mut attempted = HashSet::new();
        for instruction in &plan.moves {
            if !attempted.insert(&instruction.id) {
                debug!(id = %instruction.id, "repeated move instruction, skipping");
                continue;
            }
            let destination = instruction.destination();
            match mover.move_file(&instruction.source, &destination) {
                Ok(()) => {
                    info!(id = %instruction.id, "moved {:?} -> {:?}", instruction.source, destination);
                    report.moved.push(instruction.id.clone());
                }
                Err(err) => {
                    warn!(id = %instruction.id, "{err}");
                    report.failed.push(instruction.id.clone());
                }
            }
        }
        report
    }

}

pub mod rewrite {
    //! In-place patching of `path = ...;` fields. Only the patched field (and an
    //! optional synthesised `name` field) changes; the rest of each line is kept.

    use crate::core::EntityId;
    use crate::descriptor::DescriptorText;
    use crate::planner::RewriteRecord;
    use nom::{
        IResult,
        bytes::complete::{is_not, tag},
        character::complete::{char, multispace0},
        combinator::recognize,
        sequence::{preceded, terminated, tuple},
    };
    use serde::Serialize;
    use std::collections::HashMap;
    use tracing::{debug, warn};

    type PResult<'a, T> = IResult<&'a str, T>;

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct RewriteReport {
        pub applied: Vec<EntityId>,
        /// Records whose ID has no line carrying a `path` field.
        pub unmatched: Vec<EntityId>,
    }

    /// Apply each record to the first line that starts with its ID (case-insensitive)
    /// and carries a `path = ...;` field followed by a space.
    pub fn rewrite_descriptor(text: &mut DescriptorText, records: &[RewriteRecord]) -> RewriteReport {
        let index = index_path_lines(text);
        let mut report = RewriteReport::default();

        for record in records {
            let key = record.id.as_str().to_ascii_uppercase();
            let patched = index.get(&key).and_then(|&line_no| {
                text.line(line_no)
                    .and_then(|line| patch_line(line, &record.new_path))
                    .map(|patched| (line_no, patched))
            });
            match patched {
                Some((line_no, patched)) => {
                    debug!(id = %record.id, line = line_no + 1, "patched path");
                    text.set_line(line_no, patched);
                    report.applied.push(record.id.clone());
                }
                None => {
                    warn!(id = %record.id, "no descriptor line carries a path for this id");
                    report.unmatched.push(record.id.clone());
                }
            }
        }
        report
    }

    fn index_path_lines(text: &DescriptorText) -> HashMap<String, usize> {
        let mut index = HashMap::new();
        for (line_no, line) in text.lines().enumerate() {
            let Ok((rest, id)) = leading_id(line) else {
                continue;
            };
            let prefix_len = line.len() - rest.len();
            if find_path_field(line, prefix_len).is_some() {
                index.entry(id.to_ascii_uppercase()).or_insert(line_no);
            }
        }
        index
    }

    /// First token of the line, which must be followed by a space.
    fn leading_id(i: &str) -> PResult<'_, &str> {
        preceded(multispace0, terminated(is_not(" \t"), char(' ')))(i)
    }

    fn path_field(i: &str) -> PResult<'_, &str> {
        terminated(
            recognize(tuple((tag("path = "), is_not(";"), char(';')))),
            char(' '),
        )(i)
    }

    /// Byte range of the last `path = ...;` field (followed by a space) at or after `from`.
    fn find_path_field(line: &str, from: usize) -> Option<(usize, usize)> {
        let starts: Vec<usize> = line
            .match_indices("path = ")
            .map(|(at, _)| at)
            .filter(|&at| at >= from)
            .collect();
        starts
            .into_iter()
            .rev()
            .find_map(|at| path_field(&line[at..]).ok().map(|(_, field)| (at, at + field.len())))
    }

    fn has_name_field(line: &str) -> bool {
        line.match_indices("name = ").any(|(at, _)| {
            let boundary = at == 0 || matches!(line.as_bytes()[at - 1], b' ' | b'\t' | b'{');
            boundary && line[at + "name = ".len()..].contains(';')
        })
    }

    fn quote(value: &str) -> String {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    }

    /// Patch one line, or `None` when it carries no rewritable `path` field.
    pub fn patch_line(line: &str, new_path: &str) -> Option<String> {
        let (rest, _) = leading_id(line).ok()?;
        let (start, end) = find_path_field(line, line.len() - rest.len())?;

        let mut out = String::with_capacity(line.len() + new_path.len() + 16);
        out.push_str(&line[..start]);
        if !has_name_field(line) {
            if let Some((_, last)) = new_path.rsplit_once('/') {
                out.push_str("name = ");
                out.push_str(&quote(last));
                out.push_str("; ");
            }
        }
        out.push_str("path = ");
        out.push_str(&quote(new_path));
        out.push(';');
        out.push_str(&line[end..]);
        Some(out)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        const FILE_LINE: &str = "\t\tCCCC /* foo.m */ = {isa = PBXFileReference; lastKnownFileType = sourcecode.c.objc; path = foo.m; sourceTree = \"<group>\"; };";

        fn record(id: &str, path: &str) -> RewriteRecord {
            RewriteRecord {
                id: EntityId::new(id),
                new_path: path.into(),
            }
        }

        #[test]
        fn patch_replaces_path_and_synthesises_name() {
            let patched = patch_line(FILE_LINE, "B/foo.m").expect("patched");
            assert_eq!(
                patched,
                "\t\tCCCC /* foo.m */ = {isa = PBXFileReference; lastKnownFileType = sourcecode.c.objc; name = \"foo.m\"; path = \"B/foo.m\"; sourceTree = \"<group>\"; };"
            );
        }

        #[test]
        fn existing_name_field_is_not_duplicated() {
            let line = "CCCC /* foo.m */ = {isa = PBXFileReference; name = foo.m; path = foo.m; sourceTree = \"<group>\"; };";
            let patched = patch_line(line, "B/foo.m").expect("patched");
            assert_eq!(patched.matches("name = ").count(), 1);
            assert!(patched.contains("path = \"B/foo.m\"; sourceTree"));
        }

        #[test]
        fn path_without_separator_gets_no_name() {
            let patched = patch_line(FILE_LINE, "foo.m").expect("patched");
            assert!(!patched.contains("name = "));
            assert!(patched.contains("path = \"foo.m\";"));
        }

        #[test]
        fn bytes_outside_the_patch_are_preserved() {
            let patched = patch_line(FILE_LINE, "foo.m").expect("patched");
            let start = FILE_LINE.find("path = ").expect("path");
            let old_end = start + "path = foo.m;".len();
            let new_end = start + "path = \"foo.m\";".len();
            assert_eq!(&patched[..start], &FILE_LINE[..start]);
            assert_eq!(&patched[new_end..], &FILE_LINE[old_end..]);
        }

        #[test]
        fn rewrite_patches_only_the_matching_line() {
            let input = format!(
                "// header\n\t\t1111 /* foo.m in Sources */ = {{isa = PBXBuildFile; fileRef = CCCC /* foo.m */; }};\n{FILE_LINE}\n}}\n"
            );
            let mut text = DescriptorText::from_text(&input);
            let report = rewrite_descriptor(&mut text, &[record("cccc", "B/foo.m")]);

            assert_eq!(report.applied, vec![EntityId::new("cccc")]);
            assert!(report.unmatched.is_empty());
            let out = text.to_string();
            let before: Vec<&str> = input.lines().collect();
            let after: Vec<&str> = out.lines().collect();
            assert_eq!(before[0], after[0]);
            assert_eq!(before[1], after[1]);
            assert_ne!(before[2], after[2]);
            assert_eq!(before[3], after[3]);
        }

        #[test]
        fn unmatched_records_are_reported() {
            let mut text = DescriptorText::from_text(&format!("{FILE_LINE}\n"));
            let report = rewrite_descriptor(&mut text, &[record("9999", "X/y.m")]);
            assert_eq!(report.unmatched, vec![EntityId::new("9999")]);
            assert_eq!(text.to_string(), format!("{FILE_LINE}\n"));
        }

        #[test]
        fn line_needs_a_space_after_the_path_field() {
            assert!(patch_line("CCCC /* x */ = {path = x.m;}", "A/x.m").is_none());
        }
    }
}

pub mod listing {
    //! `list` and `full-list` rendering.

    use crate::core::*;
    use crate::linker::{Node, top_level, visit_depth_first};
    use serde::Serialize;

    pub fn top_level_names(store: &EntityStore) -> Vec<&str> {
        top_level(store)
            .into_iter()
            .map(|entity| entity.name.as_str())
            .collect()
    }

    fn render_line(out: &mut String, node: Node<'_>, depth: usize) {
        out.push_str(&" ".repeat(depth));
        out.push_str(node.name());
        out.push_str(" (");
        out.push_str(node.id().as_str());
        out.push(')');
        if let Some(location) = node.location() {
            out.push_str(" (location=");
            out.push_str(&location.raw);
            out.push(')');
        }
        out.push('\n');
    }

    /// Depth-first listing, one space of indent per level.
    pub fn full_listing(store: &EntityStore) -> String {
        let mut out = String::new();
        visit_depth_first(store, &top_level(store), |node, depth| {
            render_line(&mut out, node, depth)
        });
        out
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct TreeNode {
        pub id: EntityId,
        pub name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub location: Option<String>,
        pub dangling: bool,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub children: Vec<TreeNode>,
    }

    /// The listing as a nested tree, for JSON output.
    pub fn tree(store: &EntityStore) -> Vec<TreeNode> {
        let mut roots = Vec::new();
        let mut stack: Vec<TreeNode> = Vec::new();
        visit_depth_first(store, &top_level(store), |node, depth| {
            fold_stack(&mut stack, &mut roots, depth);
            stack.push(TreeNode {
                id: node.id().clone(),
                name: node.name().to_string(),
                location: node.location().map(|l| l.raw.clone()),
                dangling: matches!(node, Node::Dangling(_)),
                children: Vec::new(),
            });
        });
        fold_stack(&mut stack, &mut roots, 0);
        roots
    }

    fn fold_stack(stack: &mut Vec<TreeNode>, roots: &mut Vec<TreeNode>, depth: usize) {
        while stack.len() > depth {
            let Some(done) = stack.pop() else { break };
            match stack.last_mut() {
                Some(parent) => parent.children.push(done),
                None => roots.push(done),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::fixtures::{SCENARIO, linked};

        #[test]
        fn full_list_matches_scenario() {
            let store = linked(SCENARIO);
            assert_eq!(
                full_listing(&store),
                "A (AAAA)\n B (BBBB)\n  foo.m (CCCC) (location=\"<group>\")\n"
            );
        }

        #[test]
        fn list_prints_only_top_level_names() {
            let store = linked(SCENARIO);
            assert_eq!(top_level_names(&store), vec!["A"]);
        }

        #[test]
        fn tree_nests_children() {
            let store = linked(SCENARIO);
            let roots = tree(&store);
            assert_eq!(roots.len(), 1);
            assert_eq!(roots[0].children[0].name, "B");
            assert_eq!(roots[0].children[0].children[0].id, EntityId::new("CCCC"));
            assert!(!roots[0].children[0].children[0].dangling);
        }

        #[test]
        fn dangling_children_are_listed_without_location() {
            let store = linked("AAAA /* A */ = {\nchildren = (\n9999 /* Ghost */,\n);\n};\n");
            assert_eq!(full_listing(&store), "A (AAAA)\n Ghost (9999)\n");
            assert!(tree(&store)[0].children[0].dangling);
        }
    }
}

pub mod pipeline {
    //! End-to-end `sort`: parse, link, plan, move, rewrite.

    use crate::core::EntityStore;
    use crate::descriptor::DescriptorText;
    use crate::linker::link_entities;
    use crate::mover::{ExecutionReport, FileMover, execute_moves};
    use crate::parser::parse_descriptor;
    use crate::planner::{Plan, Settings, plan_reorganize};
    use crate::rewrite::{RewriteReport, rewrite_descriptor};
    use serde::Serialize;
    use std::path::Path;
    use tracing::{info, warn};

    /// Parse and link a descriptor.
    pub fn load_store(text: &DescriptorText) -> EntityStore {
        let mut store = parse_descriptor(text.lines());
        link_entities(&mut store);
        store
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct SortReport {
        pub plan: Plan,
        pub execution: ExecutionReport,
        pub rewrite: RewriteReport,
    }

    /// Reorganise files and patch `text` in memory. Writing the text back is the
    /// caller's job. A file whose move failed keeps its old descriptor path.
    pub fn sort(
        text: &mut DescriptorText,
        descriptor: &Path,
        settings: &Settings,
        mover: &dyn FileMover,
    ) -> SortReport {
        let store = load_store(text);

        info!("reordering files");
        let mut plan = plan_reorganize(&store, descriptor, settings);
        let execution = if settings.move_files {
            execute_moves(&plan, mover)
        } else {
            ExecutionReport::default()
        };
        if !execution.failed.is_empty() {
            warn!(
                count = execution.failed.len(),
                "keeping the old descriptor path for files that failed to move"
            );
            plan.suppress_rewrites(&execution.failed);
        }

        let rewrite = if settings.rewrite_descriptor {
            rewrite_descriptor(text, &plan.rewrites)
        } else {
            RewriteReport::default()
        };
        if !rewrite.unmatched.is_empty() {
            warn!(count = rewrite.unmatched.len(), "rewrite records had no matching line");
        }

        SortReport {
            plan,
            execution,
            rewrite,
        }
    }

}

pub use descriptor::DescriptorText;
pub use pipeline::{load_store, sort};
