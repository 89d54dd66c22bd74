//! Built-in MCP tools.
//!
//! - `navigation` - definitions, usages and enclosing context (3 tools)

pub mod navigation;

use std::sync::Arc;

use crate::error::Result;
use crate::mcp::handler::{ToolRegistration, ToolRegistry};
use navigation::{
    location_schema, ContainingContextTool, FindDefinitionTool, FindUsagesTool, FIND_DEFINITION,
    FIND_USAGES, GET_CONTAINING_CONTEXT,
};

/// Register the built-in tools.
pub fn register_builtin_tools(registry: &dyn ToolRegistry) -> Result<()> {
    registry.register_tool(ToolRegistration::new(
        FIND_DEFINITION,
        "Find Definition",
        "Find definition location for reference at file position",
        location_schema(),
        Arc::new(FindDefinitionTool),
    )?)?;

    registry.register_tool(ToolRegistration::new(
        FIND_USAGES,
        "Find Usages",
        "Find usages for symbol at file position",
        location_schema(),
        Arc::new(FindUsagesTool),
    )?)?;

    registry.register_tool(ToolRegistration::new(
        GET_CONTAINING_CONTEXT,
        "Get Containing Context",
        "Get containing declaration context for a file location",
        location_schema(),
        Arc::new(ContainingContextTool),
    )?)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::handler::InMemoryToolRegistry;

    #[test]
    fn test_register_builtin_tools() {
        let registry = InMemoryToolRegistry::new();
        register_builtin_tools(&registry).unwrap();

        let ids: Vec<_> = registry.list_tools().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![FIND_DEFINITION, FIND_USAGES, GET_CONTAINING_CONTEXT]);

        let schema = registry.find_tool(FIND_USAGES).unwrap().input_schema;
        assert_eq!(schema["required"], serde_json::json!(["file_path", "line"]));
    }

    #[test]
    fn test_register_builtin_tools_twice_is_idempotent() {
        let registry = InMemoryToolRegistry::new();
        register_builtin_tools(&registry).unwrap();
        register_builtin_tools(&registry).unwrap();
        assert_eq!(registry.tool_count(), 3);
    }
}
