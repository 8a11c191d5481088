use crate::definition::ProjectTemplate;
use handlebars::{Handlebars, RenderError};
use kiln_utils::ObjectWalker;

pub struct TemplateReplace<'a> {
    engine: Handlebars<'a>,
    vars: ProjectTemplate,
}

impl TemplateReplace<'_> {
    pub fn new(vars: ProjectTemplate) -> Self {
        let mut engine = Handlebars::new();
        engine.register_escape_fn(handlebars::no_escape);
        engine.set_strict_mode(true);

        TemplateReplace { engine, vars }
    }
}

impl ObjectWalker for TemplateReplace<'_> {
    type Error = RenderError;

    fn enter_string(&mut self, value: &mut String) -> Result<(), RenderError> {
        if !value.contains("{{") {
            return Ok(());
        }

        *value = self.engine.render_template(value, &self.vars)?;
        Ok(())
    }
}
