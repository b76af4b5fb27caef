//! SQL template code generator.
//!
//! A [`SqlTemplateDefinition`] renders create/remove scripts from templates.
//! `{key}` expands to the concept's key values and `{Member}` to the value of
//! that member (references expand to the referenced concept's key values).
//! Any other brace text is copied unchanged.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::code_builder::CodeBuilder;
use crate::concept::{ConceptId, ConceptModel};
use crate::error::Result;
use crate::plugins::{ConceptDatabaseDefinition, ExtraDependency};

fn default_version() -> String {
    "1".to_string()
}

/// Code inserted into another application's create script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateExtension {
    /// Template of the tag to insert before.
    pub tag: String,
    /// Template of the inserted code.
    pub code: String,
}

/// A code generator plugin driven by SQL templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlTemplateDefinition {
    /// Implementation type name.
    pub implementation: String,
    /// Implementation version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Create script template.
    #[serde(default)]
    pub create: String,
    /// Remove script template.
    #[serde(default)]
    pub remove: String,
    /// Optional extension of another application's script.
    #[serde(default)]
    pub extend: Option<TemplateExtension>,
}

impl SqlTemplateDefinition {
    /// Creates a template definition with create and remove templates.
    #[must_use]
    pub fn new(
        implementation: impl Into<String>,
        create: impl Into<String>,
        remove: impl Into<String>,
    ) -> Self {
        Self {
            implementation: implementation.into(),
            version: default_version(),
            create: create.into(),
            remove: remove.into(),
            extend: None,
        }
    }

    /// Sets the implementation version.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sets the extension inserted before `tag`.
    #[must_use]
    pub fn extend(mut self, tag: impl Into<String>, code: impl Into<String>) -> Self {
        self.extend = Some(TemplateExtension {
            tag: tag.into(),
            code: code.into(),
        });
        self
    }
}

impl ConceptDatabaseDefinition for SqlTemplateDefinition {
    fn implementation_type_name(&self) -> &str {
        &self.implementation
    }

    fn implementation_version(&self) -> &str {
        &self.version
    }

    fn create_database_structure(
        &self,
        concept: ConceptId,
        model: &ConceptModel,
    ) -> Result<String> {
        render(&self.create, concept, model)
    }

    fn remove_database_structure(
        &self,
        concept: ConceptId,
        model: &ConceptModel,
    ) -> Result<String> {
        render(&self.remove, concept, model)
    }

    fn extend_database_structure(
        &self,
        concept: ConceptId,
        model: &ConceptModel,
        code: &mut CodeBuilder,
    ) -> Result<Vec<ExtraDependency>> {
        if let Some(extension) = &self.extend {
            let tag = render(&extension.tag, concept, model)?;
            let text = render(&extension.code, concept, model)?;
            if !code.insert_code(&text, &tag) {
                warn!(
                    implementation = %self.implementation,
                    tag = %tag,
                    "Extension tag not found in generated code"
                );
            }
        }
        Ok(Vec::new())
    }
}

/// Renders a template for one concept.
pub fn render(template: &str, concept: ConceptId, model: &ConceptModel) -> Result<String> {
    let info = model.get(concept)?;
    let members = model.types().members(&info.type_name)?;

    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        output.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            output.push_str(&rest[open..]);
            rest = "";
            break;
        };

        let name = &after[..close];
        if name == "key" {
            output.push_str(&model.key_values(concept)?);
        } else if members.iter().any(|m| m.name == name) {
            output.push_str(&model.value(concept, name)?);
        } else {
            // Not a placeholder: copy the brace and rescan what follows it.
            output.push('{');
            rest = after;
            continue;
        }
        rest = &after[close + 1..];
    }
    output.push_str(rest);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::{ConceptInfo, ConceptMember, ConceptType, ConceptTypeRegistry};

    fn model() -> (ConceptModel, ConceptId, ConceptId) {
        let mut types = ConceptTypeRegistry::new();
        types
            .register(ConceptType::new("EntityInfo").member(ConceptMember::value("Name").key()))
            .unwrap();
        types
            .register(
                ConceptType::new("PropertyInfo")
                    .member(ConceptMember::reference("Entity").key())
                    .member(ConceptMember::value("Name").key())
                    .member(ConceptMember::value("SqlType")),
            )
            .unwrap();
        let mut model = ConceptModel::new(types);
        let entity = model
            .add(ConceptInfo::new("EntityInfo", vec!["Invoice".into()]))
            .unwrap();
        let property = model
            .add(ConceptInfo::new(
                "PropertyInfo",
                vec![entity.into(), "Total".into(), "NUMERIC".into()],
            ))
            .unwrap();
        (model, entity, property)
    }

    #[test]
    fn test_render_placeholders() {
        let (model, _, property) = model();
        let sql = render(
            "ALTER TABLE {Entity} ADD {Name} {SqlType} /*{key}*/ {unknown} {",
            property,
            &model,
        )
        .unwrap();
        assert_eq!(
            sql,
            "ALTER TABLE Invoice ADD Total NUMERIC /*Invoice.Total*/ {unknown} {"
        );
    }

    #[test]
    fn test_render_nested_braces() {
        let (model, entity, _) = model();
        assert_eq!(render("{ {Name}}", entity, &model).unwrap(), "{ Invoice}");
    }

    #[test]
    fn test_extension_inserts_into_tag() {
        let (model, entity, property) = model();
        let table = SqlTemplateDefinition::new(
            "EntityTable",
            "CREATE TABLE {Name} (ID TEXT/*columns {key}*/);",
            "DROP TABLE {Name};",
        );
        let column = SqlTemplateDefinition::new("PropertyColumn", "", "")
            .extend("/*columns {Entity}*/", ", {Name} {SqlType}");

        let mut code = CodeBuilder::new();
        code.append(&table.create_database_structure(entity, &model).unwrap());
        column
            .extend_database_structure(property, &model, &mut code)
            .unwrap();

        assert_eq!(
            code.as_str(),
            "CREATE TABLE Invoice (ID TEXT, Total NUMERIC/*columns Invoice*/);"
        );
        assert_eq!(
            table.remove_database_structure(entity, &model).unwrap(),
            "DROP TABLE Invoice;"
        );
    }
}
